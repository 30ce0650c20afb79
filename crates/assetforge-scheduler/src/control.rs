//! Job control façade used by the HTTP layer.

use assetforge_config::SystemConfig;
use assetforge_core::job::{
    DeadLetter, Job, JobFilter, JobStatus, NewJob, Pagination, QueueName, QueueStats,
};
use assetforge_core::validation::validate_submission;
use assetforge_core::{Error, JobId, Result};
use assetforge_db::JobStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::broadcast::ProgressBroadcaster;
use crate::cancellation::CancellationRegistry;
use crate::rate_limit::SubmissionLimiter;

/// Most dead letters returned by one query.
pub const MAX_DEAD_LETTERS: u32 = 100;

/// Validates requests, writes through the job store and announces changes.
#[derive(Clone)]
pub struct JobControl {
    config: Arc<SystemConfig>,
    store: Arc<dyn JobStore>,
    broadcaster: Arc<ProgressBroadcaster>,
    cancellations: Arc<CancellationRegistry>,
    limiter: Arc<SubmissionLimiter>,
}

impl JobControl {
    pub fn new(
        config: Arc<SystemConfig>,
        store: Arc<dyn JobStore>,
        broadcaster: Arc<ProgressBroadcaster>,
        cancellations: Arc<CancellationRegistry>,
    ) -> Self {
        let limiter = Arc::new(SubmissionLimiter::new(config.rate_limit.clone()));
        Self {
            config,
            store,
            broadcaster,
            cancellations,
            limiter,
        }
    }

    pub fn limiter(&self) -> Arc<SubmissionLimiter> {
        self.limiter.clone()
    }

    /// Validate and enqueue a submission for `owner_id`. Nothing is stored
    /// when validation fails or the owner is over a rate limit.
    pub async fn submit(
        &self,
        queue: QueueName,
        owner_id: &str,
        body: serde_json::Value,
    ) -> Result<Job> {
        if owner_id.trim().is_empty() {
            return Err(Error::Unauthorized("missing owner identity".to_string()));
        }
        let submission = validate_submission(queue, body)?;
        let max_size = self.config.queue(queue).map(|q| q.max_size).unwrap_or(1000);

        let processing = self.processing_count(owner_id).await?;
        self.limiter.check_concurrent(processing)?;
        let now = Utc::now();
        self.limiter.admit(owner_id, now).inspect_err(|e| {
            warn!(owner_id = %owner_id, queue = %queue, error = %e, "Submission rate limited");
        })?;

        let created = self
            .store
            .create(
                NewJob {
                    owner_id: owner_id.to_string(),
                    project_id: submission.project_id,
                    payload: submission.payload,
                    priority: submission.priority,
                    delay: submission.delay,
                },
                max_size,
            )
            .await;
        let job = match created {
            Ok(job) => job,
            Err(e) => {
                self.limiter.refund(owner_id, now);
                return Err(e.into());
            }
        };

        info!(
            job_id = %job.id,
            queue = %queue,
            owner_id = %owner_id,
            not_before = %job.not_before,
            "Job submitted"
        );
        self.broadcaster.publish_job(&job).await;
        Ok(job)
    }

    pub async fn status(&self, queue: QueueName, id: JobId) -> Result<Job> {
        Ok(self.store.get(queue, id).await?)
    }

    /// Cancel a pending or processing job and signal its worker.
    pub async fn cancel(&self, queue: QueueName, id: JobId) -> Result<Job> {
        let job = self.store.cancel(queue, id).await?;
        let signalled = self.cancellations.cancel(id);
        info!(job_id = %id, queue = %queue, signalled, "Job cancelled");
        self.broadcaster.publish_job(&job).await;
        Ok(job)
    }

    /// Jobs in `queue`, newest first.
    pub async fn list(
        &self,
        queue: QueueName,
        mut filter: JobFilter,
        page: Pagination,
    ) -> Result<Vec<Job>> {
        filter.queue = Some(queue);
        Ok(self.store.list(&filter, page).await?)
    }

    /// Processing jobs `owner_id` has across all queues, counted up to the
    /// concurrent limit.
    async fn processing_count(&self, owner_id: &str) -> Result<u64> {
        let filter = JobFilter {
            status: Some(JobStatus::Processing),
            owner_id: Some(owner_id.to_string()),
            ..JobFilter::default()
        };
        let cap = self.config.rate_limit.concurrent;
        let jobs = self.store.list(&filter, Pagination::new(None, Some(cap))).await?;
        Ok(jobs.len() as u64)
    }

    /// Jobs of `queue` that failed for good, newest first.
    pub async fn failed_jobs(
        &self,
        queue: QueueName,
        owner_id: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<DeadLetter>> {
        let limit = limit.unwrap_or(MAX_DEAD_LETTERS).clamp(1, MAX_DEAD_LETTERS);
        Ok(self.store.dead_letters(queue, owner_id, limit).await?)
    }

    pub async fn stats(&self, queue: QueueName) -> Result<QueueStats> {
        Ok(self.store.stats(queue).await?)
    }

    /// Remove terminal jobs older than `max_age`, or the retention default.
    pub async fn clean_queue(&self, queue: QueueName, max_age: Option<Duration>) -> Result<u64> {
        let max_age = max_age.unwrap_or(self.config.retention.max_age);
        let removed = self.store.cleanup(queue, max_age).await?;
        info!(queue = %queue, removed, max_age = ?max_age, "Cleaned queue");
        Ok(removed)
    }

    /// Store reachability.
    pub async fn ready(&self) -> Result<()> {
        Ok(self.store.ping().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetforge_core::generation::GenerationOutput;
    use assetforge_core::job::{JobOutcome, JobOutput, JobStatus};
    use assetforge_db::MemoryJobStore;
    use serde_json::json;

    fn control() -> (JobControl, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let control = JobControl::new(
            Arc::new(SystemConfig::default()),
            store.clone(),
            Arc::new(ProgressBroadcaster::new()),
            Arc::new(CancellationRegistry::new()),
        );
        (control, store)
    }

    fn knight() -> serde_json::Value {
        json!({
            "prompt": "knight",
            "assetType": "character-design",
            "width": 512,
            "height": 512,
            "count": 1
        })
    }

    #[tokio::test]
    async fn submit_creates_pending_job() {
        let (control, _) = control();
        let job = control
            .submit(QueueName::AssetGeneration, "user-1", knight())
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.owner_id, "user-1");

        let fetched = control.status(QueueName::AssetGeneration, job.id).await.unwrap();
        assert_eq!(fetched.id, job.id);
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_without_creating_a_job() {
        let (control, _) = control();
        let mut body = knight();
        body["prompt"] = json!("");
        let err = control
            .submit(QueueName::AssetGeneration, "user-1", body)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let stats = control.stats(QueueName::AssetGeneration).await.unwrap();
        assert_eq!(stats.total(), 0);
    }

    #[tokio::test]
    async fn missing_owner_is_unauthorized() {
        let (control, _) = control();
        let err = control
            .submit(QueueName::AssetGeneration, " ", knight())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn second_cancel_is_an_invalid_transition() {
        let (control, _) = control();
        let job = control
            .submit(QueueName::AssetGeneration, "user-1", knight())
            .await
            .unwrap();

        let cancelled = control.cancel(QueueName::AssetGeneration, job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let err = control
            .cancel(QueueName::AssetGeneration, job.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (control, _) = control();
        let err = control
            .status(QueueName::StylePackTraining, JobId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn stats_count_each_status() {
        let (control, store) = control();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let job = control
                .submit(QueueName::AssetGeneration, "user-1", knight())
                .await
                .unwrap();
            ids.push(job.id);
        }
        control.cancel(QueueName::AssetGeneration, ids[0]).await.unwrap();
        for worker in ["w-1", "w-2"] {
            let job = store
                .claim_next(QueueName::AssetGeneration, worker, Duration::from_secs(60))
                .await
                .unwrap()
                .unwrap();
            let lease = job.lease.clone().unwrap();
            store
                .finish(
                    &lease,
                    JobOutcome::Completed {
                        output: JobOutput::Assets(GenerationOutput {
                            assets: Vec::new(),
                            provider: "a".to_string(),
                            processing_time_ms: 1,
                        }),
                        warnings: None,
                    },
                )
                .await
                .unwrap();
        }

        let stats = control.stats(QueueName::AssetGeneration).await.unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.processing, 0);

        let listed = control
            .list(
                QueueName::AssetGeneration,
                JobFilter {
                    status: Some(JobStatus::Pending),
                    ..JobFilter::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn queue_full_rejects_submission() {
        let store = Arc::new(MemoryJobStore::new());
        let mut config = SystemConfig::default();
        for queue in &mut config.queues {
            queue.max_size = 1;
        }
        let control = JobControl::new(
            Arc::new(config),
            store,
            Arc::new(ProgressBroadcaster::new()),
            Arc::new(CancellationRegistry::new()),
        );
        control
            .submit(QueueName::AssetGeneration, "user-1", knight())
            .await
            .unwrap();
        let err = control
            .submit(QueueName::AssetGeneration, "user-1", knight())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull { .. }));
    }

    #[tokio::test]
    async fn owner_at_concurrent_limit_is_rate_limited() {
        let store = Arc::new(MemoryJobStore::new());
        let mut config = SystemConfig::default();
        config.rate_limit.concurrent = 1;
        let control = JobControl::new(
            Arc::new(config),
            store.clone(),
            Arc::new(ProgressBroadcaster::new()),
            Arc::new(CancellationRegistry::new()),
        );
        control
            .submit(QueueName::AssetGeneration, "user-1", knight())
            .await
            .unwrap();
        store
            .claim_next(QueueName::AssetGeneration, "w-1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let style_pack = json!({
            "name": "pixel",
            "referenceImages": ["a", "b", "c", "d", "e"]
        });
        let err = control
            .submit(QueueName::StylePackTraining, "user-1", style_pack)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited(msg) if msg.contains("concurrent")));

        // Other owners are unaffected.
        control
            .submit(QueueName::AssetGeneration, "user-2", knight())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_submission_does_not_use_a_rate_limit_slot() {
        let store = Arc::new(MemoryJobStore::new());
        let mut config = SystemConfig::default();
        config.rate_limit.per_minute = 2;
        for queue in &mut config.queues {
            queue.max_size = 1;
        }
        let control = JobControl::new(
            Arc::new(config),
            store,
            Arc::new(ProgressBroadcaster::new()),
            Arc::new(CancellationRegistry::new()),
        );
        let first = control
            .submit(QueueName::AssetGeneration, "user-1", knight())
            .await
            .unwrap();
        let err = control
            .submit(QueueName::AssetGeneration, "user-1", knight())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull { .. }));

        control.cancel(QueueName::AssetGeneration, first.id).await.unwrap();
        control
            .submit(QueueName::AssetGeneration, "user-1", knight())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delayed_submission_is_held_back() {
        let (control, store) = control();
        let mut body = knight();
        body["delaySeconds"] = json!(60);
        let job = control
            .submit(QueueName::AssetGeneration, "user-1", body)
            .await
            .unwrap();
        assert_eq!((job.not_before - job.created_at).num_seconds(), 60);
        assert!(
            store
                .claim_next(QueueName::AssetGeneration, "w-1", Duration::from_secs(60))
                .await
                .unwrap()
                .is_none()
        );
    }
}

//! Worker that claims jobs from a queue and runs them through failover.

use assetforge_config::QueueConfig;
use assetforge_core::event::ProgressEvent;
use assetforge_core::JobId;
use assetforge_core::job::{Job, JobOutcome, JobProgress, JobStatus, Lease, QueueName};
use assetforge_db::{DbError, JobStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broadcast::ProgressBroadcaster;
use crate::cancellation::CancellationRegistry;
use crate::orchestrator::{
    CancelCheck, FailoverEvent, FailoverOrchestrator, FailoverOutcome, FailoverResult,
};

/// Share of the progress bar before the provider starts reporting.
const DISPATCH_PERCENT: f32 = 10.0;
/// Share of the progress bar the provider's own progress maps onto.
const PROVIDER_SPAN: f32 = 85.0;
const FINALIZING_PERCENT: f32 = 95.0;

const MAX_BACKOFF: Duration = Duration::from_secs(300);
const BASE_BACKOFF: Duration = Duration::from_secs(10);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Delay before retry number `attempts + 1`: doubles from 10s, capped at 5m.
pub fn retry_backoff(attempts: u32) -> Duration {
    BASE_BACKOFF
        .saturating_mul(1u32 << attempts.min(16))
        .min(MAX_BACKOFF)
}

/// Reads the job's stored status, so a cancel written by any node is seen
/// even when this node's token was never signalled.
struct StoredCancellation {
    store: Arc<dyn JobStore>,
    queue: QueueName,
    job_id: JobId,
}

impl StoredCancellation {
    async fn read(&self) -> bool {
        match self.store.get(self.queue, self.job_id).await {
            Ok(job) => job.status == JobStatus::Cancelled,
            Err(DbError::NotFound(_)) => true,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Failed to read job status");
                false
            }
        }
    }
}

#[async_trait]
impl CancelCheck for StoredCancellation {
    async fn is_cancelled(&self) -> bool {
        self.read().await
    }
}

/// A worker that claims and executes jobs for one queue.
pub struct Worker {
    id: String,
    queue: QueueConfig,
    store: Arc<dyn JobStore>,
    orchestrator: Arc<FailoverOrchestrator>,
    broadcaster: Arc<ProgressBroadcaster>,
    cancellations: Arc<CancellationRegistry>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: QueueConfig,
        store: Arc<dyn JobStore>,
        orchestrator: Arc<FailoverOrchestrator>,
        broadcaster: Arc<ProgressBroadcaster>,
        cancellations: Arc<CancellationRegistry>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            store,
            orchestrator,
            broadcaster,
            cancellations,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the worker loop until `shutdown` fires. A job already claimed is
    /// run to the end before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, queue = %self.queue.name, "Starting worker");

        while !shutdown.is_cancelled() {
            match self
                .store
                .claim_next(self.queue.name, &self.id, self.queue.lease)
                .await
            {
                Ok(Some(job)) => {
                    info!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        attempts = job.attempts,
                        "Claimed job"
                    );
                    self.process(job).await;
                }
                Ok(None) => idle(&shutdown, self.queue.poll_interval).await,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim job");
                    idle(&shutdown, ERROR_BACKOFF).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Run one claimed job to an outcome and write it back.
    pub async fn process(&self, job: Job) {
        let Some(mut lease) = job.lease.clone() else {
            warn!(job_id = %job.id, "Claimed job carries no lease; skipping");
            return;
        };

        let cancel = self.cancellations.register(job.id);
        let stored = Arc::new(StoredCancellation {
            store: self.store.clone(),
            queue: job.queue_name,
            job_id: job.id,
        });
        // A cancel that landed between claim and register never reached the token.
        if stored.read().await {
            info!(job_id = %job.id, worker_id = %self.id, "Job cancelled before dispatch");
            self.cancellations.remove(job.id);
            return;
        }
        self.broadcaster.publish_job(&job).await;

        let (mut events, handle) = self
            .orchestrator
            .execute(job.payload.clone(), cancel.clone(), Some(stored));

        let renew_every = (self.queue.lease / 3).max(Duration::from_millis(10));
        let mut renewal = tokio::time::interval(renew_every);
        renewal.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.record(&job, &lease, &cancel, event).await,
                    None => break,
                },
                _ = renewal.tick() => {
                    match self.store.renew_lease(&lease, self.queue.lease).await {
                        Ok(renewed) => lease = renewed,
                        Err(e) => self.lost(&job, &cancel, e),
                    }
                }
            }
        }

        let outcome = match handle.await {
            Ok(result) => self.outcome(&job, result),
            Err(e) => Some(self.failure(&job, format!("failover task failed: {}", e))),
        };

        match outcome {
            Some(outcome) => self.finish(&job, &lease, outcome).await,
            None => info!(job_id = %job.id, "Job cancelled; leaving its status as written"),
        }

        self.cancellations.remove(job.id);
    }

    /// Translate one failover event into stored progress and publish it.
    async fn record(&self, job: &Job, lease: &Lease, cancel: &CancellationToken, event: FailoverEvent) {
        let (mut progress, payload) = progress_for(job.queue_name, event);
        progress.estimated_time_remaining =
            estimate_remaining(job.started_at, progress.percentage, Utc::now());
        match self.store.update_progress(lease, progress).await {
            Ok(updated) => {
                let mut event = ProgressEvent::from_job(&updated);
                if let Some(payload) = payload {
                    event = event.with_payload(payload);
                }
                self.broadcaster.publish(event).await;
            }
            Err(e) => self.lost(job, cancel, e),
        }
    }

    /// React to a rejected write. If the job left `processing` under us
    /// (cancelled, reclaimed or deleted) stop working on it.
    fn lost(&self, job: &Job, cancel: &CancellationToken, e: DbError) {
        match e {
            DbError::InvalidTransition { .. } | DbError::LeaseLost(_) | DbError::NotFound(_) => {
                if !cancel.is_cancelled() {
                    info!(job_id = %job.id, worker_id = %self.id, reason = %e, "Lost job; stopping");
                    cancel.cancel();
                }
            }
            other => warn!(job_id = %job.id, error = %other, "Failed to write job progress"),
        }
    }

    fn outcome(&self, job: &Job, result: FailoverResult) -> Option<JobOutcome> {
        let trail = result.error_trail();
        match result.outcome {
            FailoverOutcome::Succeeded { provider, output } => {
                info!(job_id = %job.id, provider = %provider, "Job succeeded");
                Some(JobOutcome::Completed {
                    output,
                    warnings: trail,
                })
            }
            FailoverOutcome::Exhausted => {
                let error = trail.unwrap_or_else(|| {
                    format!("no providers configured for queue {}", job.queue_name)
                });
                Some(self.failure(job, error))
            }
            FailoverOutcome::Cancelled => None,
        }
    }

    /// Retry while attempts remain, otherwise fail.
    fn failure(&self, job: &Job, error: String) -> JobOutcome {
        if job.attempts + 1 < self.queue.max_attempts {
            let delay = retry_backoff(job.attempts);
            warn!(job_id = %job.id, error = %error, retry_in = ?delay, "All providers failed; retrying");
            let not_before = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
                .unwrap_or_else(Utc::now);
            JobOutcome::Retry { error, not_before }
        } else {
            warn!(job_id = %job.id, error = %error, "All providers failed");
            JobOutcome::Failed { error }
        }
    }

    async fn finish(&self, job: &Job, lease: &Lease, outcome: JobOutcome) {
        match self.store.finish(lease, outcome).await {
            Ok(updated) => {
                info!(job_id = %updated.id, status = %updated.status, "Job finished");
                self.broadcaster.publish_job(&updated).await;
            }
            Err(e @ (DbError::InvalidTransition { .. } | DbError::LeaseLost(_))) => {
                info!(job_id = %job.id, reason = %e, "Outcome discarded; job changed while running");
            }
            Err(e) => {
                // Left processing; lease reclamation picks it up.
                error!(job_id = %job.id, error = %e, "Failed to write job outcome");
            }
        }
    }
}

/// Stored progress for a failover event. Non-progress events carry 0%;
/// the store keeps the higher of the stored and the new percentage.
fn progress_for(
    queue: QueueName,
    event: FailoverEvent,
) -> (JobProgress, Option<serde_json::Value>) {
    match event {
        FailoverEvent::Probing {
            provider,
            index,
            total,
        } => (
            JobProgress::new(
                0.0,
                "probing",
                format!("Checking provider {} ({}/{})", provider, index + 1, total),
            ),
            None,
        ),
        FailoverEvent::ProviderUnavailable { provider, reason } => (
            JobProgress::new(
                0.0,
                "failover",
                format!("Provider {} unavailable: {}", provider, reason),
            ),
            None,
        ),
        FailoverEvent::Dispatching { provider } => (
            JobProgress::new(
                DISPATCH_PERCENT,
                "dispatching",
                format!("Sent to provider {}", provider),
            ),
            None,
        ),
        FailoverEvent::Progress { progress, .. } => {
            let stage = match queue {
                QueueName::AssetGeneration => "generating",
                QueueName::StylePackTraining => "training",
            };
            let percentage = DISPATCH_PERCENT + progress.percentage * PROVIDER_SPAN / 100.0;
            (
                JobProgress::new(percentage, stage, progress.message),
                progress.payload,
            )
        }
        FailoverEvent::ProviderFailed { provider, error } => (
            JobProgress::new(
                0.0,
                "failover",
                format!("Provider {} failed: {}", provider, error),
            ),
            None,
        ),
        FailoverEvent::Succeeded { provider } => (
            JobProgress::new(
                FINALIZING_PERCENT,
                "finalizing",
                format!("Provider {} finished", provider),
            ),
            None,
        ),
    }
}

/// Seconds left, extrapolated linearly from the time spent reaching
/// `percentage`. `None` before any progress and once done.
fn estimate_remaining(
    started_at: Option<DateTime<Utc>>,
    percentage: f32,
    now: DateTime<Utc>,
) -> Option<u64> {
    if !(percentage > 0.0 && percentage < 100.0) {
        return None;
    }
    let elapsed_ms = (now - started_at?).num_milliseconds();
    if elapsed_ms <= 0 {
        return None;
    }
    let remaining_ms = elapsed_ms as f64 * f64::from(100.0 - percentage) / f64::from(percentage);
    Some((remaining_ms / 1000.0).round() as u64)
}

async fn idle(shutdown: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = sleep(duration) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::JobControl;
    use crate::health::HealthRegistry;
    use crate::testing::{Generate, HealthScript, ScriptedProvider, knight_job};
    use assetforge_config::{SystemConfig, TimeoutConfig};
    use assetforge_core::event::{ServerMessage, Topic};
    use assetforge_core::generation::GenerationOutput;
    use assetforge_core::job::{JobOutput, JobStatus};
    use assetforge_core::provider::GenerationProvider;
    use assetforge_db::MemoryJobStore;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    struct Harness {
        store: Arc<MemoryJobStore>,
        broadcaster: Arc<ProgressBroadcaster>,
        cancellations: Arc<CancellationRegistry>,
        orchestrator: Arc<FailoverOrchestrator>,
        queue: QueueConfig,
    }

    impl Harness {
        fn new(providers: Vec<Arc<dyn GenerationProvider>>, max_attempts: u32) -> Self {
            let timeouts = TimeoutConfig {
                health_check: Duration::from_millis(50),
                health_check_interval: Duration::from_secs(30),
                generation: Duration::from_secs(2),
                training: Duration::from_secs(2),
            };
            let health = Arc::new(HealthRegistry::new(timeouts.health_check, timeouts.health_check_interval));
            let orchestrator = FailoverOrchestrator::new(health, &timeouts)
                .with_route(QueueName::AssetGeneration, providers);
            let mut queue = QueueConfig::new(QueueName::AssetGeneration);
            queue.max_attempts = max_attempts;
            queue.poll_interval = Duration::from_millis(10);
            Self {
                store: Arc::new(MemoryJobStore::new()),
                broadcaster: Arc::new(ProgressBroadcaster::new()),
                cancellations: Arc::new(CancellationRegistry::new()),
                orchestrator: Arc::new(orchestrator),
                queue,
            }
        }

        fn worker(&self, id: &str) -> Worker {
            Worker::new(
                id,
                self.queue.clone(),
                self.store.clone(),
                self.orchestrator.clone(),
                self.broadcaster.clone(),
                self.cancellations.clone(),
            )
        }

        async fn submit(&self, prompt: &str) -> Job {
            self.store
                .create(knight_job("user-1", prompt), 1000)
                .await
                .unwrap()
        }

        async fn claim(&self, worker: &Worker) -> Job {
            self.store
                .claim_next(QueueName::AssetGeneration, worker.id(), self.queue.lease)
                .await
                .unwrap()
                .unwrap()
        }

        async fn get(&self, job: &Job) -> Job {
            self.store
                .get(QueueName::AssetGeneration, job.id)
                .await
                .unwrap()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(0), Duration::from_secs(10));
        assert_eq!(retry_backoff(1), Duration::from_secs(20));
        assert_eq!(retry_backoff(4), Duration::from_secs(160));
        assert_eq!(retry_backoff(5), MAX_BACKOFF);
        assert_eq!(retry_backoff(40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn failover_result_comes_from_healthy_provider() {
        let a = Arc::new(ScriptedProvider::new("provider-a").health(HealthScript::Hang));
        let b = Arc::new(ScriptedProvider::new("provider-b").delay(Duration::from_millis(20)));
        let harness = Harness::new(vec![a.clone(), b.clone()], 1);
        let worker = harness.worker("w-1");

        let job = harness.submit("knight").await;
        let claimed = harness.claim(&worker).await;
        worker.process(claimed).await;

        let done = harness.get(&job).await;
        assert_eq!(done.status, JobStatus::Completed);
        let Some(JobOutput::Assets(GenerationOutput { assets, provider, .. })) = &done.result
        else {
            panic!("expected assets, got {:?}", done.result);
        };
        assert_eq!(assets.len(), 1);
        assert_eq!(provider, "provider-b");
        assert!(done.last_error.unwrap().contains("provider-a"));
        assert_eq!(done.progress.percentage, 100.0);
        assert!(done.lease.is_none());
        assert!(harness.cancellations.is_empty());
    }

    #[tokio::test]
    async fn exhausted_job_fails_with_error_trail() {
        let a = Arc::new(ScriptedProvider::new("a").health(HealthScript::Fail("refused".to_string())));
        let b = Arc::new(ScriptedProvider::new("b").generate(Generate::Fail("oom".to_string())));
        let harness = Harness::new(vec![a, b], 1);
        let worker = harness.worker("w-1");

        let job = harness.submit("knight").await;
        worker.process(harness.claim(&worker).await).await;

        let done = harness.get(&job).await;
        assert_eq!(done.status, JobStatus::Failed);
        let error = done.last_error.unwrap();
        assert!(error.contains("provider a unavailable"));
        assert!(error.contains("provider b failed"));
        assert!(error.contains("oom"));
    }

    #[tokio::test]
    async fn exhausted_job_retries_while_attempts_remain() {
        let a = Arc::new(ScriptedProvider::new("a").generate(Generate::Fail("oom".to_string())));
        let harness = Harness::new(vec![a], 3);
        let worker = harness.worker("w-1");

        let job = harness.submit("knight").await;
        worker.process(harness.claim(&worker).await).await;

        let retried = harness.get(&job).await;
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.progress.stage, "retrying");
        assert_eq!(retried.progress.percentage, 0.0);
        assert!(retried.not_before > Utc::now());

        // Not eligible again until the backoff elapses.
        let next = harness
            .store
            .claim_next(QueueName::AssetGeneration, "w-2", harness.queue.lease)
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn cancelled_job_is_not_overwritten_or_retried_elsewhere() {
        let a = Arc::new(ScriptedProvider::new("a").generate(Generate::Hang));
        let b = Arc::new(ScriptedProvider::new("b"));
        let harness = Arc::new(Harness::new(vec![a.clone(), b.clone()], 1));
        let worker = harness.worker("w-1");

        let job = harness.submit("knight").await;
        let claimed = harness.claim(&worker).await;
        let running = tokio::spawn(async move { worker.process(claimed).await });

        // Wait until provider A holds the call.
        for _ in 0..100 {
            if a.calls() == 1 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(a.calls(), 1);

        harness
            .store
            .cancel(QueueName::AssetGeneration, job.id)
            .await
            .unwrap();
        assert!(harness.cancellations.cancel(job.id));
        running.await.unwrap();

        let done = harness.get(&job).await;
        assert_eq!(done.status, JobStatus::Cancelled);
        assert_eq!(b.calls(), 0);
        assert_eq!(b.health_checks(), 0);
    }

    #[tokio::test]
    async fn cancel_between_claim_and_dispatch_calls_no_provider() {
        let a = Arc::new(ScriptedProvider::new("a"));
        let harness = Harness::new(vec![a.clone()], 1);
        let worker = harness.worker("w-1");

        let job = harness.submit("knight").await;
        let claimed = harness.claim(&worker).await;
        // Not yet registered, so only the store knows.
        harness
            .store
            .cancel(QueueName::AssetGeneration, job.id)
            .await
            .unwrap();
        assert!(!harness.cancellations.cancel(job.id));

        worker.process(claimed).await;

        assert_eq!(a.health_checks(), 0);
        assert_eq!(a.calls(), 0);
        assert_eq!(harness.get(&job).await.status, JobStatus::Cancelled);
        assert!(harness.cancellations.is_empty());
    }

    #[tokio::test]
    async fn cancel_from_another_node_stops_failover() {
        let a = Arc::new(
            ScriptedProvider::new("a")
                .generate(Generate::Fail("oom".to_string()))
                .delay(Duration::from_millis(100)),
        );
        let b = Arc::new(ScriptedProvider::new("b"));
        let harness = Arc::new(Harness::new(vec![a.clone(), b.clone()], 1));
        let worker = harness.worker("w-1");
        // Shares the store but not the cancellation registry.
        let other_node = JobControl::new(
            Arc::new(SystemConfig::default()),
            harness.store.clone(),
            Arc::new(ProgressBroadcaster::new()),
            Arc::new(CancellationRegistry::new()),
        );

        let job = harness.submit("knight").await;
        let claimed = harness.claim(&worker).await;
        let running = tokio::spawn(async move { worker.process(claimed).await });

        for _ in 0..100 {
            if a.calls() == 1 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(a.calls(), 1);

        other_node
            .cancel(QueueName::AssetGeneration, job.id)
            .await
            .unwrap();
        running.await.unwrap();

        assert_eq!(b.health_checks(), 0);
        assert_eq!(b.calls(), 0);
        assert_eq!(harness.get(&job).await.status, JobStatus::Cancelled);
        assert!(harness.cancellations.is_empty());
    }

    #[test]
    fn remaining_time_extrapolates_from_elapsed() {
        let now = Utc::now();
        let started = Some(now - chrono::Duration::seconds(30));
        assert_eq!(estimate_remaining(started, 25.0, now), Some(90));
        assert_eq!(estimate_remaining(started, 50.0, now), Some(30));
        assert_eq!(estimate_remaining(started, 0.0, now), None);
        assert_eq!(estimate_remaining(started, 100.0, now), None);
        assert_eq!(estimate_remaining(None, 50.0, now), None);
    }

    #[tokio::test]
    async fn provider_progress_carries_an_estimate() {
        let a = Arc::new(
            ScriptedProvider::new("a")
                .generate(Generate::Succeed {
                    assets: 1,
                    steps: vec![50.0],
                })
                .delay(Duration::from_millis(20)),
        );
        let harness = Harness::new(vec![a], 1);
        let worker = harness.worker("w-1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = harness.broadcaster.connect(tx).await;

        let job = harness.submit("knight").await;
        harness.broadcaster.subscribe(conn, Topic::Job(job.id)).await;
        worker.process(harness.claim(&worker).await).await;

        let mut estimates = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let ServerMessage::AssetProgress(event) = message {
                if event.status == JobStatus::Processing && event.percentage > DISPATCH_PERCENT {
                    estimates.push(event.estimated_time_remaining);
                }
            }
        }
        assert!(!estimates.is_empty());
        assert!(estimates.iter().all(Option::is_some));
        assert_eq!(harness.get(&job).await.progress.estimated_time_remaining, None);
    }

    #[tokio::test]
    async fn subscribers_see_non_decreasing_progress_then_completion() {
        let a = Arc::new(ScriptedProvider::new("a").generate(Generate::Succeed {
            assets: 2,
            steps: vec![25.0, 50.0, 100.0],
        }));
        let harness = Harness::new(vec![a], 1);
        let worker = harness.worker("w-1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = harness.broadcaster.connect(tx).await;

        let job = harness.submit("knight").await;
        harness.broadcaster.subscribe(conn, Topic::Job(job.id)).await;
        worker.process(harness.claim(&worker).await).await;

        let mut seen = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let ServerMessage::AssetProgress(event) = message {
                seen.push((event.status, event.percentage));
            }
        }
        assert!(seen.len() >= 5);
        assert!(seen.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(seen.last(), Some(&(JobStatus::Completed, 100.0)));
        assert!(seen.iter().any(|(_, p)| (*p - 31.25).abs() < 0.01));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_never_share_a_job() {
        let provider = Arc::new(ScriptedProvider::new("a").delay(Duration::from_millis(10)));
        let harness = Arc::new(Harness::new(vec![provider.clone()], 1));
        for i in 0..12 {
            harness.submit(&format!("job-{}", i)).await;
        }

        let shutdown = CancellationToken::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let worker = harness.worker(&format!("w-{}", i));
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            })
            .collect();

        for _ in 0..500 {
            let stats = harness.store.stats(QueueName::AssetGeneration).await.unwrap();
            if stats.completed == 12 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        let prompts = provider.prompts();
        let unique: HashSet<_> = prompts.iter().collect();
        assert_eq!(prompts.len(), 12);
        assert_eq!(unique.len(), 12);
    }
}

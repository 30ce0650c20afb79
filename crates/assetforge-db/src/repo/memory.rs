//! In-memory job store.
//!
//! Process-local; every operation takes the map lock, so compare-and-set
//! writes are trivially atomic. Used when no database is configured, and by
//! tests.

use assetforge_core::JobId;
use assetforge_core::job::{
    DeadLetter, Job, JobFilter, JobOutcome, JobProgress, JobStatus, Lease, NewJob, Pagination, QueueName,
    QueueStats,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use super::job::{self as rules, JobStore};
use crate::{DbError, DbResult};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    letters: RwLock<Vec<DeadLetter>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed job, bypassing admission checks. For seeding.
    pub async fn insert(&self, job: Job) {
        self.jobs.write().await.insert(job.id, job);
    }

    async fn bury(&self, job: &Job) {
        if let Some(letter) = DeadLetter::from_job(job) {
            self.letters.write().await.push(letter);
        }
    }

    async fn with_job<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job) -> DbResult<T>,
    ) -> DbResult<T> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(DbError::NotFound(id))?;
        // Work on a copy so a rejected write leaves the record untouched.
        let mut draft = job.clone();
        let value = f(&mut draft)?;
        *job = draft;
        Ok(value)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new: NewJob, max_active: u64) -> DbResult<Job> {
        let queue = new.payload.queue();
        let mut jobs = self.jobs.write().await;
        let active = jobs
            .values()
            .filter(|j| j.queue_name == queue && !j.is_terminal())
            .count() as u64;
        if active >= max_active {
            return Err(DbError::QueueFull {
                queue: queue.to_string(),
                size: active,
            });
        }
        let job = Job::new(new, Utc::now());
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, queue: QueueName, id: JobId) -> DbResult<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .filter(|j| j.queue_name == queue)
            .cloned()
            .ok_or(DbError::NotFound(id))
    }

    async fn claim_next(
        &self,
        queue: QueueName,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> DbResult<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let next = jobs
            .values()
            .filter(|j| j.queue_name == queue && j.is_eligible(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.as_uuid().cmp(b.id.as_uuid()))
            })
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        rules::start(job, worker_id, lease_ttl, now)?;
        Ok(Some(job.clone()))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> DbResult<Lease> {
        let now = Utc::now();
        self.with_job(lease.job_id, |job| rules::renew(job, lease, ttl, now))
            .await
    }

    async fn update_progress(&self, lease: &Lease, progress: JobProgress) -> DbResult<Job> {
        self.with_job(lease.job_id, |job| {
            rules::progress(job, lease, progress)?;
            Ok(job.clone())
        })
        .await
    }

    async fn finish(&self, lease: &Lease, outcome: JobOutcome) -> DbResult<Job> {
        let now = Utc::now();
        let job = self
            .with_job(lease.job_id, |job| {
                rules::finish(job, lease, outcome, now)?;
                Ok(job.clone())
            })
            .await?;
        self.bury(&job).await;
        Ok(job)
    }

    async fn cancel(&self, queue: QueueName, id: JobId) -> DbResult<Job> {
        let now = Utc::now();
        self.with_job(id, |job| {
            if job.queue_name != queue {
                return Err(DbError::NotFound(id));
            }
            rules::cancel(job, now)?;
            Ok(job.clone())
        })
        .await
    }

    async fn list(&self, filter: &JobFilter, page: Pagination) -> DbResult<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut matched: Vec<&Job> = jobs.values().filter(|j| filter.matches(j)).collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn stats(&self, queue: QueueName) -> DbResult<QueueStats> {
        let jobs = self.jobs.read().await;
        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|j| j.queue_name == queue) {
            stats.record(job.status);
        }
        Ok(stats)
    }

    async fn cleanup(&self, queue: QueueName, max_age: Duration) -> DbResult<u64> {
        let cutoff = rules::before(Utc::now(), max_age);
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| j.queue_name != queue || !rules::is_expired(j, cutoff));
        Ok((before - jobs.len()) as u64)
    }

    async fn reclaim_expired(&self, queue: QueueName, max_attempts: u32) -> DbResult<Vec<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let mut reclaimed = Vec::new();
        for job in jobs.values_mut() {
            let expired = job.queue_name == queue
                && job.status == JobStatus::Processing
                && job.lease.as_ref().is_none_or(|l| l.is_expired(now));
            if expired {
                rules::reclaim(job, max_attempts, now)?;
                reclaimed.push(job.clone());
            }
        }
        drop(jobs);
        for job in &reclaimed {
            self.bury(job).await;
        }
        Ok(reclaimed)
    }

    async fn dead_letters(
        &self,
        queue: QueueName,
        owner_id: Option<&str>,
        limit: u32,
    ) -> DbResult<Vec<DeadLetter>> {
        let letters = self.letters.read().await;
        let mut matched: Vec<&DeadLetter> = letters
            .iter()
            .filter(|l| l.queue_name == queue && owner_id.is_none_or(|o| o == l.owner_id))
            .collect();
        matched.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        Ok(matched.into_iter().take(limit as usize).cloned().collect())
    }

    async fn purge_dead_letters(
        &self,
        queue: QueueName,
        max_age: Duration,
        keep: u64,
    ) -> DbResult<u64> {
        let cutoff = rules::before(Utc::now(), max_age);
        let mut letters = self.letters.write().await;
        let (mut mine, others): (Vec<_>, Vec<_>) =
            letters.drain(..).partition(|l| l.queue_name == queue);
        mine.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        let removed = rules::retain_letters(&mut mine, cutoff, keep);
        *letters = others;
        letters.extend(mine);
        Ok(removed)
    }

    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }
}

//! Job store trait and the write rules both implementations share.

use assetforge_core::JobId;
use assetforge_core::job::{
    DeadLetter, Job, JobFilter, JobOutcome, JobProgress, JobStatus, Lease, NewJob, Pagination, QueueName,
    QueueStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::{DbError, DbResult};

/// Durable record of jobs. The single source of truth for job status.
///
/// Every write is a compare-and-set keyed on the expected current status
/// (and, for worker writes, the lease holder). A write that loses a race
/// fails with [`DbError::InvalidTransition`] or [`DbError::LeaseLost`] and
/// changes nothing.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job unless the queue already holds `max_active`
    /// non-terminal jobs.
    async fn create(&self, new: NewJob, max_active: u64) -> DbResult<Job>;

    /// Fetch a job. A job filed under another queue is `NotFound`.
    async fn get(&self, queue: QueueName, id: JobId) -> DbResult<Job>;

    /// Lease the next eligible job: highest priority first, then oldest.
    async fn claim_next(
        &self,
        queue: QueueName,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> DbResult<Option<Job>>;

    /// Extend a lease the caller still holds.
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> DbResult<Lease>;

    /// Record interim progress. Percentage never moves backwards.
    async fn update_progress(&self, lease: &Lease, progress: JobProgress) -> DbResult<Job>;

    /// Write a worker's outcome and release its lease.
    async fn finish(&self, lease: &Lease, outcome: JobOutcome) -> DbResult<Job>;

    /// Cancel a pending or processing job.
    async fn cancel(&self, queue: QueueName, id: JobId) -> DbResult<Job>;

    /// Jobs matching `filter`, newest first.
    async fn list(&self, filter: &JobFilter, page: Pagination) -> DbResult<Vec<Job>>;

    async fn stats(&self, queue: QueueName) -> DbResult<QueueStats>;

    /// Delete terminal jobs older than `max_age`. Returns the number removed.
    async fn cleanup(&self, queue: QueueName, max_age: Duration) -> DbResult<u64>;

    /// Release processing jobs whose lease expired. Returns the jobs touched.
    async fn reclaim_expired(&self, queue: QueueName, max_attempts: u32) -> DbResult<Vec<Job>>;

    /// Jobs of `queue` that failed for good, newest first. Survives
    /// [`cleanup`](Self::cleanup) of the job itself.
    async fn dead_letters(
        &self,
        queue: QueueName,
        owner_id: Option<&str>,
        limit: u32,
    ) -> DbResult<Vec<DeadLetter>>;

    /// Drop dead letters older than `max_age`, then all but the newest
    /// `keep`. Returns the number removed.
    async fn purge_dead_letters(
        &self,
        queue: QueueName,
        max_age: Duration,
        keep: u64,
    ) -> DbResult<u64>;

    /// Cheap reachability check.
    async fn ping(&self) -> DbResult<()>;
}

pub(crate) fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn before(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Fail unless `job` is processing under `lease`.
pub(crate) fn check_lease(job: &Job, lease: &Lease, to: JobStatus) -> DbResult<()> {
    if job.status != JobStatus::Processing {
        return Err(DbError::InvalidTransition {
            job_id: job.id,
            from: job.status,
            to,
        });
    }
    if !job.lease_held_by(&lease.worker_id) {
        return Err(DbError::LeaseLost(job.id));
    }
    Ok(())
}

/// Move a pending job to processing under a fresh lease.
pub(crate) fn start(job: &mut Job, worker_id: &str, ttl: Duration, now: DateTime<Utc>) -> DbResult<()> {
    job.transition_to(JobStatus::Processing, now)
        .map_err(|_| DbError::InvalidTransition {
            job_id: job.id,
            from: job.status,
            to: JobStatus::Processing,
        })?;
    job.lease = Some(Lease {
        job_id: job.id,
        worker_id: worker_id.to_string(),
        expires_at: after(now, ttl),
    });
    job.progress = JobProgress::new(0.0, "starting", format!("Claimed by {}", worker_id));
    Ok(())
}

pub(crate) fn renew(job: &mut Job, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> DbResult<Lease> {
    check_lease(job, lease, JobStatus::Processing)?;
    let renewed = Lease {
        job_id: job.id,
        worker_id: lease.worker_id.clone(),
        expires_at: after(now, ttl),
    };
    job.lease = Some(renewed.clone());
    Ok(renewed)
}

pub(crate) fn progress(job: &mut Job, lease: &Lease, mut progress: JobProgress) -> DbResult<()> {
    check_lease(job, lease, JobStatus::Processing)?;
    progress.percentage = progress.percentage.max(job.progress.percentage);
    job.progress = progress;
    Ok(())
}

pub(crate) fn finish(job: &mut Job, lease: &Lease, outcome: JobOutcome, now: DateTime<Utc>) -> DbResult<()> {
    let to = outcome.target_status();
    check_lease(job, lease, to)?;
    outcome.apply(job, now).map_err(|_| DbError::InvalidTransition {
        job_id: job.id,
        from: JobStatus::Processing,
        to,
    })
}

pub(crate) fn cancel(job: &mut Job, now: DateTime<Utc>) -> DbResult<()> {
    let from = job.status;
    job.transition_to(JobStatus::Cancelled, now)
        .map_err(|_| DbError::InvalidTransition {
            job_id: job.id,
            from,
            to: JobStatus::Cancelled,
        })?;
    job.progress = JobProgress::new(job.progress.percentage, "cancelled", "Job cancelled");
    Ok(())
}

/// Release a processing job whose lease expired: back to pending while
/// attempts remain, otherwise failed.
pub(crate) fn reclaim(job: &mut Job, max_attempts: u32, now: DateTime<Utc>) -> DbResult<()> {
    let holder = job
        .lease
        .as_ref()
        .map(|l| l.worker_id.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let error = format!("lease held by {} expired before the job finished", holder);

    let outcome = if job.attempts + 1 < max_attempts {
        JobOutcome::Retry {
            error,
            not_before: now,
        }
    } else {
        JobOutcome::Failed { error }
    };
    let to = outcome.target_status();
    outcome.apply(job, now).map_err(|_| DbError::InvalidTransition {
        job_id: job.id,
        from: job.status,
        to,
    })
}

/// Terminal and older than the cutoff. Pending and processing jobs are kept
/// regardless of age.
pub(crate) fn is_expired(job: &Job, cutoff: DateTime<Utc>) -> bool {
    job.is_terminal() && job.age_reference() < cutoff
}

/// Apply dead-letter retention to one queue's letters, sorted newest first.
/// Returns the number removed.
pub(crate) fn retain_letters(letters: &mut Vec<DeadLetter>, cutoff: DateTime<Utc>, keep: u64) -> u64 {
    let before = letters.len();
    letters.retain(|l| l.failed_at >= cutoff);
    letters.truncate(usize::try_from(keep).unwrap_or(usize::MAX));
    (before - letters.len()) as u64
}

//! Error types for assetforge.

use std::time::Duration;
use thiserror::Error;

use crate::JobId;
use crate::job::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed submission. The job is never created.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A transition outside the state machine, or a lost compare-and-set race.
    #[error("invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidStateTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// Health check failed or timed out.
    #[error("provider {provider} unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    /// Generation call failed or timed out.
    #[error("provider {provider} failed: {message}")]
    ProviderError { provider: String, message: String },

    /// A health check or provider call outlived its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("queue {queue} is full ({size} active jobs)")]
    QueueFull { queue: String, size: u64 },

    /// Per-owner submission limits.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("lease on job {0} is held by another worker")]
    LeaseLost(JobId),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

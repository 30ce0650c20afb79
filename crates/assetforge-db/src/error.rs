//! Database error types.

use assetforge_core::JobId;
use assetforge_core::job::JobStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The job was not in a status that allows the write. Also what the loser
    /// of a compare-and-set race sees.
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("lease on job {0} is held by another worker")]
    LeaseLost(JobId),

    #[error("queue {queue} is full ({size} active jobs)")]
    QueueFull { queue: String, size: u64 },

    #[error("corrupt job record: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for assetforge_core::Error {
    fn from(err: DbError) -> Self {
        use assetforge_core::Error;
        match err {
            DbError::NotFound(id) => Error::NotFound(id),
            DbError::InvalidTransition { job_id, from, to } => {
                Error::InvalidStateTransition { job_id, from, to }
            }
            DbError::LeaseLost(id) => Error::LeaseLost(id),
            DbError::QueueFull { queue, size } => Error::QueueFull { queue, size },
            other => Error::Internal(other.to_string()),
        }
    }
}

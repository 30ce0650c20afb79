//! PostgreSQL job store.
//!
//! Worker and control writes lock the row (`FOR UPDATE`), apply the shared
//! transition rules and write the record back in one transaction. Claiming
//! uses `SKIP LOCKED` so concurrent workers never wait on each other.
//! Admission serializes per queue on a transaction-scoped advisory lock.

use assetforge_core::JobId;
use assetforge_core::job::{
    DeadLetter, Job, JobFilter, JobOutcome, JobProgress, JobStatus, Lease, NewJob, Pagination, Priority,
    QueueName, QueueStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

use super::job::{self as rules, JobStore};
use crate::{DbError, DbResult};

/// A job row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub id: uuid::Uuid,
    pub queue_name: String,
    pub owner_id: String,
    pub project_id: Option<String>,
    pub payload: serde_json::Value,
    pub status: String,
    pub priority: i16,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(r: JobRecord) -> DbResult<Self> {
        let id = JobId::from_uuid(r.id);
        let lease = match (r.lease_owner, r.lease_expires_at) {
            (Some(worker_id), Some(expires_at)) => Some(Lease {
                job_id: id,
                worker_id,
                expires_at,
            }),
            _ => None,
        };
        Ok(Job {
            id,
            queue_name: r.queue_name.parse().map_err(DbError::Corrupt)?,
            owner_id: r.owner_id,
            project_id: r.project_id,
            payload: serde_json::from_value(r.payload)?,
            status: r.status.parse().map_err(DbError::Corrupt)?,
            priority: Priority::from_i16(r.priority),
            attempts: u32::try_from(r.attempts)
                .map_err(|_| DbError::Corrupt(format!("job {} has negative attempts", id)))?,
            created_at: r.created_at,
            not_before: r.not_before,
            started_at: r.started_at,
            completed_at: r.completed_at,
            progress: serde_json::from_value(r.progress)?,
            result: r.result.map(serde_json::from_value).transpose()?,
            last_error: r.last_error,
            lease,
        })
    }
}

/// A dead-letter row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetterRecord {
    pub job_id: uuid::Uuid,
    pub queue_name: String,
    pub owner_id: String,
    pub project_id: Option<String>,
    pub payload: serde_json::Value,
    pub error: String,
    pub attempts: i32,
    pub failed_at: DateTime<Utc>,
}

impl TryFrom<DeadLetterRecord> for DeadLetter {
    type Error = DbError;

    fn try_from(r: DeadLetterRecord) -> DbResult<Self> {
        let job_id = JobId::from_uuid(r.job_id);
        Ok(DeadLetter {
            job_id,
            queue_name: r.queue_name.parse().map_err(DbError::Corrupt)?,
            owner_id: r.owner_id,
            project_id: r.project_id,
            payload: serde_json::from_value(r.payload)?,
            error: r.error,
            attempts: u32::try_from(r.attempts).map_err(|_| {
                DbError::Corrupt(format!("dead letter {} has negative attempts", job_id))
            })?,
            failed_at: r.failed_at,
        })
    }
}

/// PostgreSQL implementation of JobStore.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock one row, let `f` mutate it, then write it back. An error from
    /// `f` rolls the transaction back.
    async fn mutate<T, F>(&self, id: JobId, f: F) -> DbResult<T>
    where
        T: Send,
        F: FnOnce(&mut Job) -> DbResult<T> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, id).await?;
        let value = f(&mut job)?;
        write_back(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(value)
    }
}

async fn lock_job(tx: &mut Transaction<'_, Postgres>, id: JobId) -> DbResult<Job> {
    sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(DbError::NotFound(id))?
        .try_into()
}

async fn write_back(tx: &mut Transaction<'_, Postgres>, job: &Job) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2, attempts = $3, not_before = $4, started_at = $5, completed_at = $6,
            progress = $7, result = $8, last_error = $9, lease_owner = $10, lease_expires_at = $11
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.attempts as i32)
    .bind(job.not_before)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(serde_json::to_value(&job.progress)?)
    .bind(job.result.as_ref().map(serde_json::to_value).transpose()?)
    .bind(job.last_error.as_deref())
    .bind(job.lease.as_ref().map(|l| l.worker_id.as_str()))
    .bind(job.lease.as_ref().map(|l| l.expires_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Record a dead letter if `job` just failed.
async fn bury(tx: &mut Transaction<'_, Postgres>, job: &Job) -> DbResult<()> {
    let Some(letter) = DeadLetter::from_job(job) else {
        return Ok(());
    };
    sqlx::query(
        r#"
        INSERT INTO dead_letters (job_id, queue_name, owner_id, project_id, payload, error,
                                  attempts, failed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (job_id) DO NOTHING
        "#,
    )
    .bind(letter.job_id.as_uuid())
    .bind(letter.queue_name.as_str())
    .bind(&letter.owner_id)
    .bind(letter.project_id.as_deref())
    .bind(serde_json::to_value(&letter.payload)?)
    .bind(&letter.error)
    .bind(letter.attempts as i32)
    .bind(letter.failed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

const ACTIVE: &str = "('pending', 'processing')";
const TERMINAL: &str = "('completed', 'failed', 'cancelled')";

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, new: NewJob, max_active: u64) -> DbResult<Job> {
        let job = Job::new(new, Utc::now());
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(job.queue_name.as_str())
            .execute(&mut *tx)
            .await?;

        let (active,) = sqlx::query_as::<_, (i64,)>(&format!(
            "SELECT COUNT(*) FROM jobs WHERE queue_name = $1 AND status IN {ACTIVE}"
        ))
        .bind(job.queue_name.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let active = active.max(0) as u64;
        if active >= max_active {
            return Err(DbError::QueueFull {
                queue: job.queue_name.to_string(),
                size: active,
            });
        }

        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO jobs (id, queue_name, owner_id, project_id, payload, status, priority,
                              attempts, created_at, not_before, progress)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, 0, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.queue_name.as_str())
        .bind(&job.owner_id)
        .bind(job.project_id.as_deref())
        .bind(serde_json::to_value(&job.payload)?)
        .bind(job.priority.as_i16())
        .bind(job.created_at)
        .bind(job.not_before)
        .bind(serde_json::to_value(&job.progress)?)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        record.try_into()
    }

    async fn get(&self, queue: QueueName, id: JobId) -> DbResult<Job> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1 AND queue_name = $2")
            .bind(id.as_uuid())
            .bind(queue.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::NotFound(id))?
            .try_into()
    }

    async fn claim_next(
        &self,
        queue: QueueName,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> DbResult<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs
            WHERE queue_name = $1 AND status = 'pending' AND not_before <= NOW()
            ORDER BY priority DESC, created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(queue.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(record) = record else {
            return Ok(None);
        };
        let mut job: Job = record.try_into()?;
        rules::start(&mut job, worker_id, lease_ttl, Utc::now())?;
        write_back(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> DbResult<Lease> {
        self.mutate(lease.job_id, |job| rules::renew(job, lease, ttl, Utc::now()))
            .await
    }

    async fn update_progress(&self, lease: &Lease, progress: JobProgress) -> DbResult<Job> {
        self.mutate(lease.job_id, |job| {
            rules::progress(job, lease, progress)?;
            Ok(job.clone())
        })
        .await
    }

    async fn finish(&self, lease: &Lease, outcome: JobOutcome) -> DbResult<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, lease.job_id).await?;
        rules::finish(&mut job, lease, outcome, Utc::now())?;
        write_back(&mut tx, &job).await?;
        bury(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn cancel(&self, queue: QueueName, id: JobId) -> DbResult<Job> {
        self.mutate(id, |job| {
            if job.queue_name != queue {
                return Err(DbError::NotFound(id));
            }
            rules::cancel(job, Utc::now())?;
            Ok(job.clone())
        })
        .await
    }

    async fn list(&self, filter: &JobFilter, page: Pagination) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs
            WHERE ($1::text IS NULL OR queue_name = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR owner_id = $3)
              AND ($4::text IS NULL OR project_id = $4)
            ORDER BY created_at DESC
            OFFSET $5 LIMIT $6
            "#,
        )
        .bind(filter.queue.map(|q| q.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.owner_id.as_deref())
        .bind(filter.project_id.as_deref())
        .bind(i64::from(page.offset))
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Job::try_from).collect()
    }

    async fn stats(&self, queue: QueueName) -> DbResult<QueueStats> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs WHERE queue_name = $1 GROUP BY status",
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let status: JobStatus = status.parse().map_err(DbError::Corrupt)?;
            stats.add(status, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn cleanup(&self, queue: QueueName, max_age: Duration) -> DbResult<u64> {
        let cutoff = rules::before(Utc::now(), max_age);
        let result = sqlx::query(&format!(
            r#"
            DELETE FROM jobs
            WHERE queue_name = $1
              AND status IN {TERMINAL}
              AND COALESCE(completed_at, created_at) < $2
            "#
        ))
        .bind(queue.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reclaim_expired(&self, queue: QueueName, max_attempts: u32) -> DbResult<Vec<Job>> {
        let mut tx = self.pool.begin().await?;
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs
            WHERE queue_name = $1 AND status = 'processing'
              AND (lease_expires_at IS NULL OR lease_expires_at <= NOW())
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let now = Utc::now();
        let mut reclaimed = Vec::with_capacity(records.len());
        for record in records {
            let mut job: Job = record.try_into()?;
            rules::reclaim(&mut job, max_attempts, now)?;
            write_back(&mut tx, &job).await?;
            bury(&mut tx, &job).await?;
            reclaimed.push(job);
        }
        tx.commit().await?;
        Ok(reclaimed)
    }

    async fn dead_letters(
        &self,
        queue: QueueName,
        owner_id: Option<&str>,
        limit: u32,
    ) -> DbResult<Vec<DeadLetter>> {
        let records = sqlx::query_as::<_, DeadLetterRecord>(
            r#"
            SELECT * FROM dead_letters
            WHERE queue_name = $1 AND ($2::text IS NULL OR owner_id = $2)
            ORDER BY failed_at DESC
            LIMIT $3
            "#,
        )
        .bind(queue.as_str())
        .bind(owner_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(DeadLetter::try_from).collect()
    }

    async fn purge_dead_letters(
        &self,
        queue: QueueName,
        max_age: Duration,
        keep: u64,
    ) -> DbResult<u64> {
        let cutoff = rules::before(Utc::now(), max_age);
        let result = sqlx::query(
            r#"
            DELETE FROM dead_letters
            WHERE queue_name = $1
              AND (failed_at < $2
                   OR job_id IN (SELECT job_id FROM dead_letters
                                 WHERE queue_name = $1
                                 ORDER BY failed_at DESC
                                 OFFSET $3))
            "#,
        )
        .bind(queue.as_str())
        .bind(cutoff)
        .bind(i64::try_from(keep).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

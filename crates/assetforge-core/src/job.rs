//! Job records and the job lifecycle state machine.
//!
//! ```text
//! pending ──► processing ──► completed | failed
//!    ▲            │
//!    └── retry ───┘
//! pending | processing ──► cancelled
//! ```
//!
//! `completed`, `failed` and `cancelled` are terminal and immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::generation::{GenerationOutput, GenerationRequest, StylePackOutput, StylePackRequest};
use crate::{Error, JobId, Result};

/// Named durable queue a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    AssetGeneration,
    StylePackTraining,
}

impl QueueName {
    pub const ALL: [QueueName; 2] = [QueueName::AssetGeneration, QueueName::StylePackTraining];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::AssetGeneration => "asset-generation",
            QueueName::StylePackTraining => "style-pack-training",
        }
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue '{}'", s))
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Processing, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim priority. Higher values are claimed first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_i16(&self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            i16::MIN..=0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Urgent,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Progress snapshot stored with the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub percentage: f32,
    pub stage: String,
    pub message: String,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
}

impl JobProgress {
    pub fn new(percentage: f32, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            percentage: percentage.clamp(0.0, 100.0),
            stage: stage.into(),
            message: message.into(),
            estimated_time_remaining: None,
        }
    }

    pub fn queued() -> Self {
        Self::new(0.0, "queued", "Waiting for a worker")
    }
}

impl Default for JobProgress {
    fn default() -> Self {
        Self::queued()
    }
}

/// Work a job carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobPayload {
    Generation(GenerationRequest),
    StylePack(StylePackRequest),
}

impl JobPayload {
    /// Queue that services this payload.
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::Generation(_) => QueueName::AssetGeneration,
            JobPayload::StylePack(_) => QueueName::StylePackTraining,
        }
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobOutput {
    Assets(GenerationOutput),
    StylePack(StylePackOutput),
}

impl JobOutput {
    pub fn provider(&self) -> &str {
        match self {
            JobOutput::Assets(out) => &out.provider,
            JobOutput::StylePack(out) => &out.provider,
        }
    }
}

/// Exclusive, time-bounded claim a worker holds on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub job_id: JobId,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A job record. Owned by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub queue_name: QueueName,
    pub owner_id: String,
    pub project_id: Option<String>,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub priority: Priority,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Not eligible for claiming before this instant.
    pub not_before: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub result: Option<JobOutput>,
    pub last_error: Option<String>,
    pub lease: Option<Lease>,
}

/// Fields supplied when creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: String,
    pub project_id: Option<String>,
    pub payload: JobPayload,
    pub priority: Priority,
    /// Hold the job back from workers for this long after creation.
    pub delay: Duration,
}

impl Job {
    pub fn new(new: NewJob, now: DateTime<Utc>) -> Self {
        let not_before = chrono::Duration::from_std(new.delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        Self {
            id: JobId::new(),
            queue_name: new.payload.queue(),
            owner_id: new.owner_id,
            project_id: new.project_id,
            payload: new.payload,
            status: JobStatus::Pending,
            priority: new.priority,
            attempts: 0,
            created_at: now,
            not_before,
            started_at: None,
            completed_at: None,
            progress: JobProgress::queued(),
            result: None,
            last_error: None,
            lease: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending and past its `not_before`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.not_before <= now
    }

    /// Instant used for retention: completion time, else creation time.
    pub fn age_reference(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }

    pub fn lease_held_by(&self, worker_id: &str) -> bool {
        self.lease
            .as_ref()
            .map(|l| l.worker_id == worker_id)
            .unwrap_or(false)
    }

    /// Move to `to`, stamping timestamps. Rejects edges outside the state machine.
    pub fn transition_to(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                job_id: self.id,
                from: self.status,
                to,
            });
        }

        match to {
            JobStatus::Processing => self.started_at = Some(now),
            JobStatus::Pending => {
                self.attempts += 1;
                self.started_at = None;
            }
            _ => self.completed_at = Some(now),
        }
        if to != JobStatus::Processing {
            self.lease = None;
        }
        self.status = to;
        Ok(())
    }
}

/// Outcome a worker writes back when it releases its lease.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed {
        output: JobOutput,
        /// Failures from providers tried before the one that succeeded.
        warnings: Option<String>,
    },
    Failed {
        error: String,
    },
    /// Transient failure: back to `pending`, eligible again at `not_before`.
    Retry {
        error: String,
        not_before: DateTime<Utc>,
    },
}

impl JobOutcome {
    pub fn target_status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed { .. } => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::Retry { .. } => JobStatus::Pending,
        }
    }

    /// Apply to a job already known to be `processing`.
    pub fn apply(self, job: &mut Job, now: DateTime<Utc>) -> Result<()> {
        job.transition_to(self.target_status(), now)?;
        match self {
            JobOutcome::Completed { output, warnings } => {
                job.result = Some(output);
                job.last_error = warnings;
                job.progress = JobProgress::new(100.0, "completed", "Job completed");
            }
            JobOutcome::Failed { error } => {
                job.progress = JobProgress::new(job.progress.percentage, "failed", error.clone());
                job.last_error = Some(error);
            }
            JobOutcome::Retry { error, not_before } => {
                job.not_before = not_before;
                job.progress = JobProgress::new(
                    0.0,
                    "retrying",
                    format!("Retry {} scheduled after: {}", job.attempts, error),
                );
                job.last_error = Some(error);
            }
        }
        Ok(())
    }
}

/// Record of a job that failed for good, kept for inspection after the
/// job itself is cleaned up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job_id: JobId,
    pub queue_name: QueueName,
    pub owner_id: String,
    pub project_id: Option<String>,
    pub payload: JobPayload,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// `None` unless the job is `failed`.
    pub fn from_job(job: &Job) -> Option<Self> {
        if job.status != JobStatus::Failed {
            return None;
        }
        Some(Self {
            job_id: job.id,
            queue_name: job.queue_name,
            owner_id: job.owner_id.clone(),
            project_id: job.project_id.clone(),
            payload: job.payload.clone(),
            error: job.last_error.clone().unwrap_or_default(),
            attempts: job.attempts,
            failed_at: job.completed_at.unwrap_or(job.created_at),
        })
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    pub queue: Option<QueueName>,
    pub status: Option<JobStatus>,
    pub owner_id: Option<String>,
    pub project_id: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.queue.is_none_or(|q| q == job.queue_name)
            && self.status.is_none_or(|s| s == job.status)
            && self
                .owner_id
                .as_deref()
                .is_none_or(|o| o == job.owner_id)
            && self
                .project_id
                .as_deref()
                .is_none_or(|p| job.project_id.as_deref() == Some(p))
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Pagination {
    pub fn new(offset: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            offset: offset.unwrap_or(0),
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Per-status job counts for a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    /// Non-terminal jobs.
    pub fn active(&self) -> u64 {
        self.pending + self.processing
    }

    pub fn total(&self) -> u64 {
        self.active() + self.completed + self.failed + self.cancelled
    }
}

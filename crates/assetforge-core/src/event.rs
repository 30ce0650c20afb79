//! Progress events, broadcast topics and live-channel messages.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::JobId;
use crate::job::{Job, JobStatus, QueueName};

/// Broadcast scope. A closed set so keys cannot collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(tag = "scope", content = "id", rename_all = "lowercase")]
pub enum Topic {
    #[display("job:{_0}")]
    Job(JobId),
    #[display("project:{_0}")]
    Project(String),
    #[display("user:{_0}")]
    User(String),
    #[display("global")]
    Global,
}

/// A progress update for one job. Transient: never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub queue_name: QueueName,
    pub status: JobStatus,
    pub percentage: f32,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Seconds, extrapolated from progress so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip)]
    pub owner_id: String,
}

impl ProgressEvent {
    /// Snapshot of a job's current status and progress.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            queue_name: job.queue_name,
            status: job.status,
            percentage: job.progress.percentage,
            stage: job.progress.stage.clone(),
            message: Some(job.progress.message.clone()),
            estimated_time_remaining: job.progress.estimated_time_remaining,
            timestamp: Utc::now(),
            payload: None,
            project_id: job.project_id.clone(),
            owner_id: job.owner_id.clone(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Messages sent by a live-progress client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SubscribeJob {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    UnsubscribeJob {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    SubscribeProject {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    UnsubscribeProject {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    /// Join the monitoring topic that sees every job.
    SubscribeGlobal,
    UnsubscribeGlobal,
    Authenticate {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Ping,
}

/// Messages sent to a live-progress client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    Authenticated {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Subscribed {
        topic: Topic,
    },
    Unsubscribed {
        topic: Topic,
    },
    /// Job topic, asset-generation queue.
    AssetProgress(ProgressEvent),
    /// Job topic, style-pack-training queue.
    StyleTrainingProgress(ProgressEvent),
    /// Project topic.
    Progress(ProgressEvent),
    /// Global monitoring topic.
    ProgressUpdate(ProgressEvent),
    Notification {
        title: String,
        message: String,
        #[serde(rename = "jobId", default, skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
    },
    SystemMessage {
        message: String,
    },
    ServerShutdown {
        message: String,
    },
    Pong,
    Error {
        message: String,
    },
}

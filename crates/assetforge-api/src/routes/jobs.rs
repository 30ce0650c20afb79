//! Job control endpoints, scoped by queue.

use assetforge_core::JobId;
use assetforge_core::job::{
    DeadLetter, Job, JobFilter, JobOutput, JobProgress, JobStatus, Pagination, QueueName,
    QueueStats,
};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::AppState;
use crate::error::ApiError;

/// Header carrying the caller identity, set by the auth layer in front.
pub const USER_ID_HEADER: &str = "x-user-id";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{queue}/jobs", get(list_jobs).post(submit_job))
        .route("/{queue}/jobs/{id}", get(get_job))
        .route("/{queue}/jobs/{id}/cancel", post(cancel_job))
        .route("/{queue}/stats", get(queue_stats))
        .route("/{queue}/dead-letters", get(dead_letters))
        .route("/{queue}/cleanup", post(cleanup_queue))
}

fn parse_queue(raw: &str) -> Result<QueueName, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("unknown queue '{}'", raw)))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid job id '{}'", raw)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    job_id: JobId,
    queue_name: QueueName,
    status: JobStatus,
    created_at: DateTime<Utc>,
    not_before: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobResponse {
    job_id: JobId,
    queue_name: QueueName,
    status: JobStatus,
    owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
    attempts: u32,
    progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    created_at: DateTime<Utc>,
    not_before: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            queue_name: job.queue_name,
            status: job.status,
            owner_id: job.owner_id,
            project_id: job.project_id,
            attempts: job.attempts,
            progress: job.progress,
            result: job.result,
            error: job.last_error,
            created_at: job.created_at,
            not_before: job.not_before,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

async fn submit_job(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let queue = parse_queue(&queue)?;
    let owner_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let job = state.control.submit(queue, owner_id, body).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            job_id: job.id,
            queue_name: job.queue_name,
            status: job.status,
            created_at: job.created_at,
            not_before: job.not_before,
        }),
    ))
}

async fn get_job(
    State(state): State<AppState>,
    Path((queue, id)): Path<(String, String)>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .control
        .status(parse_queue(&queue)?, parse_job_id(&id)?)
        .await?;
    Ok(Json(job.into()))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path((queue, id)): Path<(String, String)>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .control
        .cancel(parse_queue(&queue)?, parse_job_id(&id)?)
        .await?;
    Ok(Json(job.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListJobsQuery {
    status: Option<JobStatus>,
    owner_id: Option<String>,
    project_id: Option<String>,
    offset: Option<u32>,
    limit: Option<u32>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let filter = JobFilter {
        queue: None,
        status: query.status,
        owner_id: query.owner_id,
        project_id: query.project_id,
    };
    let jobs = state
        .control
        .list(
            parse_queue(&queue)?,
            filter,
            Pagination::new(query.offset, query.limit),
        )
        .await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeadLettersQuery {
    owner_id: Option<String>,
    limit: Option<u32>,
}

/// Jobs that failed for good, newest first.
async fn dead_letters(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(query): Query<DeadLettersQuery>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let letters = state
        .control
        .failed_jobs(parse_queue(&queue)?, query.owner_id.as_deref(), query.limit)
        .await?;
    Ok(Json(letters))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    queue_name: QueueName,
    #[serde(flatten)]
    stats: QueueStats,
    total: u64,
}

async fn queue_stats(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<StatsResponse>, ApiError> {
    let queue = parse_queue(&queue)?;
    let stats = state.control.stats(queue).await?;
    Ok(Json(StatsResponse {
        queue_name: queue,
        total: stats.total(),
        stats,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CleanupRequest {
    max_age_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CleanupResponse {
    queue_name: QueueName,
    removed: u64,
}

/// Body is optional; without `maxAgeMs` the retention default applies.
async fn cleanup_queue(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    body: Bytes,
) -> Result<Json<CleanupResponse>, ApiError> {
    let queue = parse_queue(&queue)?;
    let request: CleanupRequest = if body.is_empty() {
        CleanupRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid cleanup request: {}", e)))?
    };

    let removed = state
        .control
        .clean_queue(queue, request.max_age_ms.map(Duration::from_millis))
        .await?;
    Ok(Json(CleanupResponse {
        queue_name: queue,
        removed,
    }))
}

//! Job commands.

use anyhow::Result;
use assetforge_core::generation::{AssetFormat, AssetType, QualityLevel, StyleType};
use assetforge_core::job::{JobStatus, Priority, QueueName};
use serde_json::{Map, Value, json};
use std::time::Duration;

use super::print_json;
use crate::client::ApiClient;

pub struct GenerateArgs {
    pub prompt: String,
    pub asset_type: AssetType,
    pub style: Option<StyleType>,
    pub quality: Option<QualityLevel>,
    pub format: Option<AssetFormat>,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub count: Option<u32>,
    pub seed: Option<u64>,
    pub project: Option<String>,
    pub priority: Option<Priority>,
    /// Seconds to hold the job back before workers may claim it.
    pub delay: Option<u32>,
}

impl GenerateArgs {
    /// Submission body. Unset options are left to the server defaults.
    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("prompt".into(), json!(self.prompt));
        body.insert("assetType".into(), json!(self.asset_type.as_str()));
        insert(&mut body, "style", self.style.map(|s| s.as_str()));
        insert(&mut body, "quality", self.quality.map(|q| q.as_str()));
        insert(&mut body, "format", self.format.map(|f| f.as_str()));
        insert(&mut body, "negativePrompt", self.negative_prompt.as_deref());
        insert(&mut body, "width", self.width);
        insert(&mut body, "height", self.height);
        insert(&mut body, "count", self.count);
        insert(&mut body, "seed", self.seed);
        insert(&mut body, "projectId", self.project.as_deref());
        insert(&mut body, "priority", self.priority.map(priority_name));
        insert(&mut body, "delaySeconds", self.delay);
        Value::Object(body)
    }
}

pub struct StylePackArgs {
    pub name: String,
    pub images: Vec<String>,
    pub description: Option<String>,
    pub steps: Option<u32>,
    pub resolution: Option<u32>,
    pub project: Option<String>,
    pub priority: Option<Priority>,
    /// Seconds to hold the job back before workers may claim it.
    pub delay: Option<u32>,
}

impl StylePackArgs {
    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("name".into(), json!(self.name));
        body.insert("referenceImages".into(), json!(self.images));
        insert(&mut body, "description", self.description.as_deref());
        insert(&mut body, "trainingSteps", self.steps);
        insert(&mut body, "resolution", self.resolution);
        insert(&mut body, "projectId", self.project.as_deref());
        insert(&mut body, "priority", self.priority.map(priority_name));
        insert(&mut body, "delaySeconds", self.delay);
        Value::Object(body)
    }
}

pub struct ListArgs {
    pub status: Option<JobStatus>,
    pub owner: Option<String>,
    pub project: Option<String>,
    pub offset: Option<u32>,
    pub limit: u32,
}

impl ListArgs {
    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![("limit", self.limit.to_string())];
        if let Some(status) = self.status {
            query.push(("status", status.to_string()));
        }
        if let Some(owner) = &self.owner {
            query.push(("ownerId", owner.clone()));
        }
        if let Some(project) = &self.project {
            query.push(("projectId", project.clone()));
        }
        if let Some(offset) = self.offset {
            query.push(("offset", offset.to_string()));
        }
        query
    }
}

fn insert<T: Into<Value>>(body: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        body.insert(key.to_string(), value.into());
    }
}

fn priority_name(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "normal",
        Priority::High => "high",
        Priority::Urgent => "urgent",
    }
}

fn job_path(queue: QueueName, id: &str) -> String {
    format!("/api/v1/queues/{}/jobs/{}", queue, id)
}

pub async fn submit(client: &ApiClient, queue: QueueName, body: &Value) -> Result<()> {
    let created = client
        .post(&format!("/api/v1/queues/{}/jobs", queue), body)
        .await?;
    println!(
        "Submitted job {} to {}",
        created["jobId"].as_str().unwrap_or("?"),
        queue
    );
    Ok(())
}

/// Print a job. With `follow`, poll at that interval until it is terminal.
pub async fn status(
    client: &ApiClient,
    queue: QueueName,
    id: &str,
    follow: Option<Duration>,
) -> Result<()> {
    let Some(interval) = follow else {
        let job = client.get(&job_path(queue, id), &[]).await?;
        return print_json(&job);
    };

    let mut last = String::new();
    loop {
        let job = client.get(&job_path(queue, id), &[]).await?;
        let line = progress_line(&job);
        if line != last {
            println!("{}", line);
            last = line;
        }
        if is_terminal(&job) {
            return print_json(&job);
        }
        tokio::time::sleep(interval).await;
    }
}

pub async fn cancel(client: &ApiClient, queue: QueueName, id: &str) -> Result<()> {
    let job = client
        .post(&format!("{}/cancel", job_path(queue, id)), &json!({}))
        .await?;
    println!(
        "Job {} is {}",
        id,
        job["status"].as_str().unwrap_or("unknown")
    );
    Ok(())
}

pub async fn list(client: &ApiClient, queue: QueueName, args: &ListArgs) -> Result<()> {
    let jobs = client
        .get(&format!("/api/v1/queues/{}/jobs", queue), &args.query())
        .await?;
    let jobs = jobs.as_array().cloned().unwrap_or_default();
    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    for job in &jobs {
        println!(
            "{}  {:<10} {:>5.1}%  {}",
            job["jobId"].as_str().unwrap_or("?"),
            job["status"].as_str().unwrap_or("?"),
            job["progress"]["percentage"].as_f64().unwrap_or(0.0),
            job["createdAt"].as_str().unwrap_or("")
        );
    }
    Ok(())
}

fn progress_line(job: &Value) -> String {
    format!(
        "[{}] {:>5.1}% {}: {}",
        job["status"].as_str().unwrap_or("?"),
        job["progress"]["percentage"].as_f64().unwrap_or(0.0),
        job["progress"]["stage"].as_str().unwrap_or(""),
        job["progress"]["message"].as_str().unwrap_or("")
    )
}

fn is_terminal(job: &Value) -> bool {
    job["status"]
        .as_str()
        .and_then(|s| s.parse::<JobStatus>().ok())
        .is_some_and(|s| s.is_terminal())
}

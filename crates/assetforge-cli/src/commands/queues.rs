//! Queue commands.

use anyhow::Result;
use assetforge_core::job::{JobStatus, QueueName};
use serde_json::json;
use std::time::Duration;

use crate::client::ApiClient;

pub async fn stats(client: &ApiClient, queue: QueueName) -> Result<()> {
    let stats = client
        .get(&format!("/api/v1/queues/{}/stats", queue), &[])
        .await?;
    println!("{}", queue);
    for status in JobStatus::ALL {
        let key = status.as_str();
        println!("  {:<11} {}", key, stats[key].as_u64().unwrap_or(0));
    }
    println!("  {:<11} {}", "total", stats["total"].as_u64().unwrap_or(0));
    Ok(())
}

/// Print jobs that failed for good, newest first.
pub async fn failed(
    client: &ApiClient,
    queue: QueueName,
    owner: Option<String>,
    limit: u32,
) -> Result<()> {
    let mut query = vec![("limit", limit.to_string())];
    if let Some(owner) = owner {
        query.push(("ownerId", owner));
    }
    let letters = client
        .get(&format!("/api/v1/queues/{}/dead-letters", queue), &query)
        .await?;
    let letters = letters.as_array().cloned().unwrap_or_default();
    if letters.is_empty() {
        println!("No failed jobs");
        return Ok(());
    }
    for letter in &letters {
        println!(
            "{}  {}  {:<12} {}",
            letter["jobId"].as_str().unwrap_or("?"),
            letter["failedAt"].as_str().unwrap_or(""),
            letter["ownerId"].as_str().unwrap_or("?"),
            letter["error"].as_str().unwrap_or("")
        );
    }
    Ok(())
}

pub async fn cleanup(client: &ApiClient, queue: QueueName, max_age: Option<Duration>) -> Result<()> {
    let body = match max_age {
        Some(age) => json!({ "maxAgeMs": age.as_millis() as u64 }),
        None => json!({}),
    };
    let response = client
        .post(&format!("/api/v1/queues/{}/cleanup", queue), &body)
        .await?;
    println!(
        "Removed {} jobs from {}",
        response["removed"].as_u64().unwrap_or(0),
        queue
    );
    Ok(())
}

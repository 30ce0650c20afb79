//! Generation provider trait and health types.
//!
//! Providers are external generation backends (a self-hosted model service,
//! a third-party API). Each adapter implements [`GenerationProvider`];
//! availability is decided by the health check, never by construction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::generation::{GenerationOutput, GenerationRequest, StylePackOutput, StylePackRequest};

/// Failure reported by a provider adapter.
#[derive(Debug, Error)]
pub enum ProviderFailure {
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{operation} is not supported by provider {provider}")]
    Unsupported { operation: String, provider: String },
}

pub type ProviderResult<T> = std::result::Result<T, ProviderFailure>;

/// Interim progress reported by a provider while a call is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderProgress {
    /// Provider-local completion, 0-100.
    pub percentage: f32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    /// Partial results, e.g. assets finished so far or a training step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ProviderProgress {
    pub fn new(percentage: f32, message: impl Into<String>) -> Self {
        Self {
            percentage: percentage.clamp(0.0, 100.0),
            message: message.into(),
            step: None,
            total_steps: None,
            payload: None,
        }
    }

    pub fn with_steps(mut self, step: u32, total_steps: u32) -> Self {
        self.step = Some(step);
        self.total_steps = Some(total_steps);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Callback a provider uses to report interim progress.
#[derive(Clone, Default)]
pub struct ProgressSink(Option<Arc<dyn Fn(ProviderProgress) + Send + Sync>>);

impl ProgressSink {
    pub fn new(f: impl Fn(ProviderProgress) + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(f)))
    }

    /// A sink that drops every report.
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn report(&self, progress: ProviderProgress) {
        if let Some(f) = &self.0 {
            f(progress);
        }
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProgressSink")
            .field(&self.0.is_some())
            .finish()
    }
}

/// Last known health of a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub provider_id: String,
    pub healthy: bool,
    pub last_checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProviderHealth {
    pub fn healthy(provider_id: impl Into<String>, latency: Duration) -> Self {
        Self {
            provider_id: provider_id.into(),
            healthy: true,
            last_checked_at: Utc::now(),
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        }
    }

    pub fn unhealthy(provider_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            healthy: false,
            last_checked_at: Utc::now(),
            latency_ms: None,
            error: Some(error.into()),
        }
    }

    /// Stale after twice the check interval.
    pub fn is_stale(&self, check_interval: Duration, now: DateTime<Utc>) -> bool {
        let max_age = chrono::Duration::from_std(check_interval * 2)
            .unwrap_or(chrono::Duration::MAX);
        now - self.last_checked_at > max_age
    }
}

/// Trait for generation backends.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Stable id used in configuration and error trails.
    fn id(&self) -> &str;

    /// Cheap liveness check. Callers bound it with a short timeout.
    async fn health_check(&self) -> ProviderResult<()>;

    /// Generate assets. Callers bound it with the generation timeout.
    async fn generate(
        &self,
        request: &GenerationRequest,
        progress: &ProgressSink,
    ) -> ProviderResult<GenerationOutput>;

    /// Train a style pack.
    ///
    /// Default implementation returns `Unsupported`.
    async fn train_style(
        &self,
        _request: &StylePackRequest,
        _progress: &ProgressSink,
    ) -> ProviderResult<StylePackOutput> {
        Err(ProviderFailure::Unsupported {
            operation: "style-pack training".to_string(),
            provider: self.id().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn health_goes_stale_after_twice_the_check_interval() {
        let mut health = ProviderHealth::healthy("primary", Duration::from_millis(12));
        let now = Utc::now();
        health.last_checked_at = now - chrono::Duration::seconds(90);
        assert!(!health.is_stale(Duration::from_secs(60), now));
        assert!(health.is_stale(Duration::from_secs(30), now));
    }

    #[test]
    fn progress_sink_forwards_reports() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            ProgressSink::new(move |p| seen.lock().unwrap().push(p.percentage))
        };
        sink.report(ProviderProgress::new(25.0, "a"));
        sink.report(ProviderProgress::new(150.0, "b"));
        ProgressSink::noop().report(ProviderProgress::new(10.0, "dropped"));
        assert_eq!(*seen.lock().unwrap(), vec![25.0, 100.0]);
    }

    struct GenerateOnly;

    #[async_trait]
    impl GenerationProvider for GenerateOnly {
        fn id(&self) -> &str {
            "generate-only"
        }

        async fn health_check(&self) -> ProviderResult<()> {
            Ok(())
        }

        async fn generate(
            &self,
            _request: &GenerationRequest,
            _progress: &ProgressSink,
        ) -> ProviderResult<GenerationOutput> {
            Err(ProviderFailure::Rejected("not in this test".to_string()))
        }
    }

    #[tokio::test]
    async fn training_is_unsupported_by_default() {
        let request = StylePackRequest {
            name: "pixel".to_string(),
            description: None,
            reference_images: vec![],
            training_steps: 100,
            resolution: 512,
        };
        let err = GenerateOnly
            .train_style(&request, &ProgressSink::noop())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderFailure::Unsupported { .. }));
    }
}

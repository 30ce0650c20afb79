//! Provider health cache and background refresher.

use assetforge_core::Error;
use assetforge_core::provider::{GenerationProvider, ProviderHealth};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Last health check result per provider.
pub struct HealthRegistry {
    records: RwLock<HashMap<String, ProviderHealth>>,
    check_timeout: Duration,
    check_interval: Duration,
}

impl HealthRegistry {
    pub fn new(check_timeout: Duration, check_interval: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            check_timeout,
            check_interval,
        }
    }

    /// A healthy record young enough to trust without probing.
    pub async fn fresh(&self, provider_id: &str) -> Option<ProviderHealth> {
        let records = self.records.read().await;
        records
            .get(provider_id)
            .filter(|h| h.healthy && !h.is_stale(self.check_interval, Utc::now()))
            .cloned()
    }

    /// Check health under the check timeout and record the result.
    pub async fn refresh(&self, provider: &dyn GenerationProvider) -> ProviderHealth {
        let started = Instant::now();
        let health = match tokio::time::timeout(self.check_timeout, provider.health_check()).await {
            Ok(Ok(())) => ProviderHealth::healthy(provider.id(), started.elapsed()),
            Ok(Err(e)) => ProviderHealth::unhealthy(provider.id(), e.to_string()),
            Err(_) => ProviderHealth::unhealthy(
                provider.id(),
                Error::Timeout {
                    operation: "health check",
                    after: self.check_timeout,
                }
                .to_string(),
            ),
        };
        debug!(provider = %provider.id(), healthy = health.healthy, "checked provider health");
        self.records
            .write()
            .await
            .insert(provider.id().to_string(), health.clone());
        health
    }

    /// Reuse a fresh healthy record, otherwise check again. `Err` carries the reason
    /// the provider is unavailable.
    pub async fn check(&self, provider: &dyn GenerationProvider) -> Result<(), String> {
        if self.fresh(provider.id()).await.is_some() {
            return Ok(());
        }
        let health = self.refresh(provider).await;
        if health.healthy {
            Ok(())
        } else {
            Err(health.error.unwrap_or_else(|| "unhealthy".to_string()))
        }
    }

    /// Mark a provider unhealthy after a failed call so the next job checks it again.
    pub async fn invalidate(&self, provider_id: &str) {
        self.records.write().await.remove(provider_id);
    }

    pub async fn snapshot(&self) -> Vec<ProviderHealth> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        all
    }

    /// Check every provider each check interval until `shutdown` fires.
    pub fn spawn_refresher(
        self: Arc<Self>,
        providers: Vec<Arc<dyn GenerationProvider>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let checks = providers.iter().map(|p| self.refresh(p.as_ref()));
                        for health in futures::future::join_all(checks).await {
                            if !health.healthy {
                                warn!(
                                    provider = %health.provider_id,
                                    error = health.error.as_deref().unwrap_or(""),
                                    "provider unhealthy"
                                );
                            }
                        }
                    }
                }
            }
        })
    }
}

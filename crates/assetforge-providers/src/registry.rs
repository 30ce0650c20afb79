//! Provider registry.
//!
//! Adapters are chosen by configured kind at startup. Construction never
//! checks the backend; whether a provider is usable is decided by its
//! health check at dispatch time.

use assetforge_config::{ProviderConfig, ProviderKind, SystemConfig};
use assetforge_core::provider::GenerationProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::hosted::HostedApiProvider;
use crate::local::LocalServiceProvider;

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn GenerationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured provider, sharing one HTTP client.
    pub fn from_config(config: &SystemConfig) -> Self {
        let client = reqwest::Client::new();
        let mut registry = Self::new();
        for provider in &config.providers {
            registry.register(build(provider, client.clone()));
        }
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn GenerationProvider>) {
        info!(provider = %provider.id(), "registered provider");
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn GenerationProvider>> {
        self.providers.get(id).cloned()
    }

    /// Providers for `ids`, in that order. Unknown ids are skipped.
    pub fn chain(&self, ids: &[String]) -> Vec<Arc<dyn GenerationProvider>> {
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn all(&self) -> Vec<Arc<dyn GenerationProvider>> {
        let mut providers: Vec<_> = self.providers.values().cloned().collect();
        providers.sort_by(|a, b| a.id().cmp(b.id()));
        providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn build(config: &ProviderConfig, client: reqwest::Client) -> Arc<dyn GenerationProvider> {
    match config.kind {
        ProviderKind::LocalService => Arc::new(LocalServiceProvider::new(
            &config.id,
            config.base_url.clone(),
            client,
        )),
        ProviderKind::HostedApi => {
            let api_key = config
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|key| !key.is_empty());
            if api_key.is_none() {
                warn!(provider = %config.id, "API key not set; provider will fail health checks");
            }
            Arc::new(HostedApiProvider::new(
                &config.id,
                config.base_url.clone(),
                api_key,
                client,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetforge_config::parse_system_config;

    #[test]
    fn builds_providers_from_config() {
        let config = parse_system_config(
            r#"
            provider "primary" kind="local-service" base-url="http://127.0.0.1:9"
            provider "fallback" kind="hosted-api" base-url="https://api.example.net" api-key-env="ASSETFORGE_TEST_UNSET_KEY"
            queue "asset-generation" {
                providers "primary" "fallback"
            }
            "#,
        )
        .unwrap();
        let registry = ProviderRegistry::from_config(&config);
        assert_eq!(registry.len(), 2);

        let queue = config
            .queue(assetforge_core::job::QueueName::AssetGeneration)
            .unwrap();
        let chain: Vec<_> = registry
            .chain(&queue.providers)
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(chain, vec!["primary", "fallback"]);
    }
}

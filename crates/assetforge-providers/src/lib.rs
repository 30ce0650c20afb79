//! Generation provider adapters for assetforge.
//!
//! Provides provider implementations for dispatching generation jobs:
//! - Self-hosted model service (local GPU box)
//! - Hosted third-party image API

pub mod hosted;
mod http;
pub mod local;
pub mod mapping;
pub mod registry;

#[cfg(test)]
mod testing;

pub use assetforge_core::provider::{
    GenerationProvider, ProgressSink, ProviderFailure, ProviderHealth, ProviderProgress,
    ProviderResult,
};
pub use hosted::HostedApiProvider;
pub use local::LocalServiceProvider;
pub use registry::ProviderRegistry;

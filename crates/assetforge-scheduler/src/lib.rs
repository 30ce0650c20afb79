//! Job scheduling for assetforge.
//!
//! Runs per-queue worker pools that lease jobs from the job store, drive
//! them through provider failover and broadcast progress to live clients.

pub mod broadcast;
pub mod cancellation;
pub mod control;
pub mod dispatcher;
pub mod health;
pub mod maintenance;
pub mod orchestrator;
pub mod rate_limit;
pub mod runtime;
pub mod worker;

#[cfg(test)]
mod testing;

pub use broadcast::{ConnectionSender, ProgressBroadcaster};
pub use cancellation::CancellationRegistry;
pub use control::JobControl;
pub use dispatcher::Dispatcher;
pub use health::HealthRegistry;
pub use maintenance::Maintenance;
pub use orchestrator::{
    AttemptState, FailoverEvent, FailoverOrchestrator, FailoverOutcome, FailoverResult,
    ProviderAttempt,
};
pub use rate_limit::SubmissionLimiter;
pub use runtime::Scheduler;
pub use worker::Worker;

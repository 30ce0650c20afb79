//! Application state.

use assetforge_scheduler::{HealthRegistry, JobControl, ProgressBroadcaster, Scheduler};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub control: JobControl,
    pub broadcaster: Arc<ProgressBroadcaster>,
    pub health: Arc<HealthRegistry>,
}

impl AppState {
    pub fn new(
        control: JobControl,
        broadcaster: Arc<ProgressBroadcaster>,
        health: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            control,
            broadcaster,
            health,
        }
    }

    pub fn from_scheduler(scheduler: &Scheduler) -> Self {
        Self::new(
            scheduler.control(),
            scheduler.broadcaster(),
            scheduler.health(),
        )
    }
}

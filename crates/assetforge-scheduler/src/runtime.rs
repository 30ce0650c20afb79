//! Scheduler runtime: wires the store, providers and background tasks.

use assetforge_config::SystemConfig;
use assetforge_db::JobStore;
use assetforge_providers::ProviderRegistry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcast::ProgressBroadcaster;
use crate::cancellation::CancellationRegistry;
use crate::control::JobControl;
use crate::dispatcher::Dispatcher;
use crate::health::HealthRegistry;
use crate::maintenance::Maintenance;
use crate::orchestrator::FailoverOrchestrator;

/// A running scheduler. Dropping it without [`Scheduler::shutdown`] leaves
/// the background tasks running until the runtime stops.
pub struct Scheduler {
    control: JobControl,
    broadcaster: Arc<ProgressBroadcaster>,
    health: Arc<HealthRegistry>,
    dispatcher: Dispatcher,
    background: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start worker pools, the health refresher and maintenance.
    pub fn start(
        config: Arc<SystemConfig>,
        store: Arc<dyn JobStore>,
        registry: ProviderRegistry,
    ) -> Self {
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let cancellations = Arc::new(CancellationRegistry::new());
        let health = Arc::new(HealthRegistry::new(
            config.timeouts.health_check,
            config.timeouts.health_check_interval,
        ));
        let orchestrator = Arc::new(FailoverOrchestrator::from_config(
            &config,
            &registry,
            health.clone(),
        ));

        for queue in &config.queues {
            if orchestrator.providers_for(queue.name).is_empty() {
                warn!(queue = %queue.name, "No providers configured; jobs will fail");
            }
        }

        let control = JobControl::new(
            config.clone(),
            store.clone(),
            broadcaster.clone(),
            cancellations.clone(),
        );
        let dispatcher = Dispatcher::start(
            &config.queues,
            store.clone(),
            orchestrator,
            broadcaster.clone(),
            cancellations,
        );

        let background = CancellationToken::new();
        let maintenance = Arc::new(
            Maintenance::new(config, store, broadcaster.clone()).with_limiter(control.limiter()),
        );
        let tasks = vec![
            health.clone().spawn_refresher(registry.all(), background.clone()),
            maintenance.spawn(background.clone()),
        ];

        info!(
            workers = dispatcher.worker_count(),
            providers = registry.len(),
            "Scheduler started"
        );

        Self {
            control,
            broadcaster,
            health,
            dispatcher,
            background,
            tasks,
        }
    }

    pub fn control(&self) -> JobControl {
        self.control.clone()
    }

    pub fn broadcaster(&self) -> Arc<ProgressBroadcaster> {
        self.broadcaster.clone()
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        self.health.clone()
    }

    /// Cancelling the returned token stops every worker from claiming;
    /// jobs already claimed run on. Safe to cancel more than once.
    pub fn claim_stopper(&self) -> CancellationToken {
        self.dispatcher.stop_token()
    }

    /// Stop claiming, tell clients, wait for in-flight jobs, then stop the
    /// background tasks.
    pub async fn shutdown(self) {
        self.dispatcher.stop();
        self.broadcaster
            .shutdown("Server is shutting down")
            .await;
        self.dispatcher.join().await;
        self.background.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Scheduler stopped");
    }
}

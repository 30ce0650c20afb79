//! Fixed-size worker pools, one per queue.

use assetforge_config::QueueConfig;
use assetforge_db::JobStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broadcast::ProgressBroadcaster;
use crate::cancellation::CancellationRegistry;
use crate::orchestrator::FailoverOrchestrator;
use crate::worker::Worker;

/// Running worker pools.
pub struct Dispatcher {
    shutdown: CancellationToken,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl Dispatcher {
    /// Spawn `concurrency` workers for every queue.
    pub fn start(
        queues: &[QueueConfig],
        store: Arc<dyn JobStore>,
        orchestrator: Arc<FailoverOrchestrator>,
        broadcaster: Arc<ProgressBroadcaster>,
        cancellations: Arc<CancellationRegistry>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        // Distinguishes this node's workers in lease records.
        let node = Uuid::new_v4().simple().to_string();
        let node = &node[..8];

        let mut workers = Vec::new();
        for queue in queues {
            for n in 0..queue.concurrency {
                let worker = Worker::new(
                    format!("{}-{}-{}", queue.name, n, node),
                    queue.clone(),
                    store.clone(),
                    orchestrator.clone(),
                    broadcaster.clone(),
                    cancellations.clone(),
                );
                let id = worker.id().to_string();
                let token = shutdown.clone();
                workers.push((id, tokio::spawn(async move { worker.run(token).await })));
            }
            info!(queue = %queue.name, concurrency = queue.concurrency, "Started worker pool");
        }

        Self { shutdown, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop claiming new jobs. Workers finish the job they hold.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Token that stops claiming when cancelled, for callers that outlive
    /// a borrow of the dispatcher.
    pub fn stop_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop and wait for every worker to exit.
    pub async fn join(self) {
        self.stop();
        for (id, handle) in self.workers {
            if let Err(e) = handle.await {
                warn!(worker_id = %id, error = %e, "Worker task ended abnormally");
            }
        }
    }
}

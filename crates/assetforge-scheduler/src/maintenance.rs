//! Background maintenance: lease reclamation, retention cleanup and queue
//! depth monitoring.

use assetforge_config::SystemConfig;
use assetforge_core::job::QueueName;
use assetforge_db::JobStore;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::ProgressBroadcaster;
use crate::rate_limit::SubmissionLimiter;

/// Queue depth, as a share of `max_size`, that triggers a warning.
const DEPTH_WARNING_RATIO: f64 = 0.8;

pub struct Maintenance {
    config: Arc<SystemConfig>,
    store: Arc<dyn JobStore>,
    broadcaster: Arc<ProgressBroadcaster>,
    limiter: Option<Arc<SubmissionLimiter>>,
    /// Queues currently above the warning depth. Clients hear about a queue
    /// once per crossing.
    crowded: Mutex<HashSet<QueueName>>,
}

impl Maintenance {
    pub fn new(
        config: Arc<SystemConfig>,
        store: Arc<dyn JobStore>,
        broadcaster: Arc<ProgressBroadcaster>,
    ) -> Self {
        Self {
            config,
            store,
            broadcaster,
            limiter: None,
            crowded: Mutex::new(HashSet::new()),
        }
    }

    /// Also prune idle rate-limit counters on each cleanup pass.
    pub fn with_limiter(mut self, limiter: Arc<SubmissionLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Return expired leases to the queue. Returns the number of jobs touched.
    pub async fn reclaim(&self) -> usize {
        let mut touched = 0;
        for queue in &self.config.queues {
            match self.store.reclaim_expired(queue.name, queue.max_attempts).await {
                Ok(jobs) => {
                    for job in &jobs {
                        warn!(
                            job_id = %job.id,
                            queue = %queue.name,
                            status = %job.status,
                            "Reclaimed job with expired lease"
                        );
                        self.broadcaster.publish_job(job).await;
                    }
                    touched += jobs.len();
                }
                Err(e) => warn!(queue = %queue.name, error = %e, "Failed to reclaim leases"),
            }
        }
        touched
    }

    /// Apply retention to every queue and its dead letters. Returns the
    /// number of jobs removed.
    pub async fn cleanup(&self) -> u64 {
        let retention = &self.config.retention;
        let mut removed = 0;
        for queue in &self.config.queues {
            match self.store.cleanup(queue.name, retention.max_age).await {
                Ok(0) => {}
                Ok(n) => {
                    info!(queue = %queue.name, removed = n, "Removed expired jobs");
                    removed += n;
                }
                Err(e) => warn!(queue = %queue.name, error = %e, "Failed to clean queue"),
            }
            match self
                .store
                .purge_dead_letters(queue.name, retention.dead_letter_age, retention.dead_letter_max)
                .await
            {
                Ok(0) => {}
                Ok(n) => info!(queue = %queue.name, removed = n, "Purged dead letters"),
                Err(e) => warn!(queue = %queue.name, error = %e, "Failed to purge dead letters"),
            }
        }
        if let Some(limiter) = &self.limiter {
            limiter.prune(Utc::now());
        }
        removed
    }

    /// Warn about queues close to their size limit, and tell live clients
    /// when a queue first crosses the line.
    pub async fn check_depth(&self) {
        for queue in &self.config.queues {
            let stats = match self.store.stats(queue.name).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(queue = %queue.name, error = %e, "Failed to read queue stats");
                    continue;
                }
            };
            let active = stats.active();
            let nearly_full = active as f64 > queue.max_size as f64 * DEPTH_WARNING_RATIO;
            let newly = {
                let mut crowded = self.crowded.lock().await;
                if nearly_full {
                    crowded.insert(queue.name)
                } else {
                    crowded.remove(&queue.name);
                    false
                }
            };

            if nearly_full {
                warn!(
                    queue = %queue.name,
                    active,
                    max_size = queue.max_size,
                    "Queue is nearly full"
                );
            } else {
                debug!(queue = %queue.name, active, "Queue depth");
            }
            if newly {
                self.broadcaster
                    .system_message(format!(
                        "Queue {} is nearly full ({}/{} active jobs); new submissions may be rejected",
                        queue.name, active, queue.max_size
                    ))
                    .await;
            }
        }
    }

    /// Run until `shutdown`: reclaim and depth checks every shortest lease,
    /// cleanup every retention interval.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let reclaim_every = self
                .config
                .queues
                .iter()
                .map(|q| q.lease)
                .min()
                .unwrap_or(Duration::from_secs(60));
            let mut reclaim = tokio::time::interval(reclaim_every);
            let mut cleanup = tokio::time::interval(self.config.retention.cleanup_interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = reclaim.tick() => {
                        self.reclaim().await;
                        self.check_depth().await;
                    }
                    _ = cleanup.tick() => {
                        self.cleanup().await;
                    }
                }
            }
            debug!("Maintenance stopped");
        })
    }
}

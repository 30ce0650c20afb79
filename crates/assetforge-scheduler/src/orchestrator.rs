//! Failover orchestrator - tries providers in priority order until one succeeds.
//!
//! Per job:
//!
//! ```text
//! Idle -> Probing[i] -> Unavailable ----------------------> Probing[i+1] -> ... -> Exhausted
//!                    -> Dispatching -> Failed ------------> Probing[i+1]
//!                                   -> Succeeded (short-circuit)
//! ```
//!
//! A failed health check or a failed call is never a job failure on its own; only
//! running out of candidates is.

use assetforge_config::{SystemConfig, TimeoutConfig};
use assetforge_core::Error;
use assetforge_core::job::{JobOutput, JobPayload, QueueName};
use assetforge_core::provider::{GenerationProvider, ProgressSink, ProviderProgress, ProviderResult};
use assetforge_providers::ProviderRegistry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::health::HealthRegistry;

/// Cancellation recorded outside this process, typically in the job store.
/// Consulted at the same checkpoints as the in-process token.
#[async_trait]
pub trait CancelCheck: Send + Sync {
    async fn is_cancelled(&self) -> bool;
}

/// State of one provider attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptState {
    Probing,
    Unavailable { reason: String },
    Dispatching,
    Failed { error: String },
    Succeeded,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Unavailable { .. } | AttemptState::Failed { .. } | AttemptState::Succeeded
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderAttempt {
    pub provider: String,
    pub state: AttemptState,
}

impl ProviderAttempt {
    /// Failure description in the error taxonomy, if the attempt failed.
    pub fn failure(&self) -> Option<Error> {
        match &self.state {
            AttemptState::Unavailable { reason } => Some(Error::ProviderUnavailable {
                provider: self.provider.clone(),
                reason: reason.clone(),
            }),
            AttemptState::Failed { error } => Some(Error::ProviderError {
                provider: self.provider.clone(),
                message: error.clone(),
            }),
            _ => None,
        }
    }
}

/// Event emitted while a job fails over.
#[derive(Debug, Clone)]
pub enum FailoverEvent {
    Probing {
        provider: String,
        index: usize,
        total: usize,
    },
    ProviderUnavailable {
        provider: String,
        reason: String,
    },
    Dispatching {
        provider: String,
    },
    Progress {
        provider: String,
        progress: ProviderProgress,
    },
    ProviderFailed {
        provider: String,
        error: String,
    },
    Succeeded {
        provider: String,
    },
}

#[derive(Debug)]
pub enum FailoverOutcome {
    Succeeded { provider: String, output: JobOutput },
    /// Every candidate was tried and none succeeded.
    Exhausted,
    /// Stopped at a checkpoint because the job was cancelled.
    Cancelled,
}

/// Result of a failover run.
#[derive(Debug)]
pub struct FailoverResult {
    pub outcome: FailoverOutcome,
    pub attempts: Vec<ProviderAttempt>,
}

impl FailoverResult {
    /// One entry per failed attempt, in order. `None` when nothing failed.
    pub fn error_trail(&self) -> Option<String> {
        let failures: Vec<String> = self
            .attempts
            .iter()
            .filter_map(|a| a.failure())
            .map(|e| e.to_string())
            .collect();
        if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        }
    }
}

/// Runs the failover loop for one job at a time.
pub struct FailoverOrchestrator {
    routes: HashMap<QueueName, Vec<Arc<dyn GenerationProvider>>>,
    health: Arc<HealthRegistry>,
    generation_timeout: Duration,
    training_timeout: Duration,
}

impl FailoverOrchestrator {
    pub fn new(health: Arc<HealthRegistry>, timeouts: &TimeoutConfig) -> Self {
        Self {
            routes: HashMap::new(),
            health,
            generation_timeout: timeouts.generation,
            training_timeout: timeouts.training,
        }
    }

    /// Routes every configured queue to its provider chain.
    pub fn from_config(
        config: &SystemConfig,
        registry: &ProviderRegistry,
        health: Arc<HealthRegistry>,
    ) -> Self {
        config
            .queues
            .iter()
            .fold(Self::new(health, &config.timeouts), |orchestrator, queue| {
                orchestrator.with_route(queue.name, registry.chain(&queue.providers))
            })
    }

    /// Set the provider chain for a queue, highest priority first.
    pub fn with_route(
        mut self,
        queue: QueueName,
        providers: Vec<Arc<dyn GenerationProvider>>,
    ) -> Self {
        self.routes.insert(queue, providers);
        self
    }

    pub fn providers_for(&self, queue: QueueName) -> &[Arc<dyn GenerationProvider>] {
        self.routes.get(&queue).map(Vec::as_slice).unwrap_or_default()
    }

    /// Run failover for `payload`, returning a channel of events and a handle
    /// to get the final result.
    ///
    /// `cancel` is checked before each health check and each dispatch, and aborts an
    /// in-flight call. `check`, when given, is consulted at the same points;
    /// a positive answer cancels `cancel` too.
    pub fn execute(
        &self,
        payload: JobPayload,
        cancel: CancellationToken,
        check: Option<Arc<dyn CancelCheck>>,
    ) -> (
        mpsc::Receiver<FailoverEvent>,
        tokio::task::JoinHandle<FailoverResult>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let providers = self.providers_for(payload.queue()).to_vec();
        let health = self.health.clone();
        let timeout = match payload {
            JobPayload::Generation(_) => self.generation_timeout,
            JobPayload::StylePack(_) => self.training_timeout,
        };

        let handle = tokio::spawn(async move {
            Self::execute_inner(providers, health, timeout, payload, cancel, check, tx).await
        });

        (rx, handle)
    }

    async fn execute_inner(
        providers: Vec<Arc<dyn GenerationProvider>>,
        health: Arc<HealthRegistry>,
        timeout: Duration,
        payload: JobPayload,
        cancel: CancellationToken,
        check: Option<Arc<dyn CancelCheck>>,
        tx: mpsc::Sender<FailoverEvent>,
    ) -> FailoverResult {
        let total = providers.len();
        let mut attempts: Vec<ProviderAttempt> = Vec::with_capacity(total);

        for (index, provider) in providers.iter().enumerate() {
            let id = provider.id().to_string();

            if Self::checkpoint(&cancel, check.as_deref()).await {
                return Self::cancelled(attempts);
            }

            attempts.push(ProviderAttempt {
                provider: id.clone(),
                state: AttemptState::Probing,
            });
            let _ = tx
                .send(FailoverEvent::Probing {
                    provider: id.clone(),
                    index,
                    total,
                })
                .await;

            let health_check = tokio::select! {
                _ = cancel.cancelled() => return Self::cancelled(attempts),
                checked = health.check(provider.as_ref()) => checked,
            };
            if let Err(reason) = health_check {
                warn!(provider = %id, reason = %reason, "provider unavailable, failing over");
                Self::settle(&mut attempts, AttemptState::Unavailable { reason: reason.clone() });
                let _ = tx
                    .send(FailoverEvent::ProviderUnavailable {
                        provider: id,
                        reason,
                    })
                    .await;
                continue;
            }

            if Self::checkpoint(&cancel, check.as_deref()).await {
                return Self::cancelled(attempts);
            }

            Self::settle(&mut attempts, AttemptState::Dispatching);
            let _ = tx
                .send(FailoverEvent::Dispatching {
                    provider: id.clone(),
                })
                .await;
            info!(provider = %id, "dispatching to provider");

            let sink = {
                let tx = tx.clone();
                let id = id.clone();
                // Interim progress is best-effort; a full channel drops the report.
                ProgressSink::new(move |progress| {
                    let _ = tx.try_send(FailoverEvent::Progress {
                        provider: id.clone(),
                        progress,
                    });
                })
            };

            let call = tokio::time::timeout(timeout, Self::dispatch(provider.as_ref(), &payload, &sink));
            let result = tokio::select! {
                _ = cancel.cancelled() => return Self::cancelled(attempts),
                result = call => result,
            };

            let error = match result {
                Ok(Ok(output)) => {
                    Self::settle(&mut attempts, AttemptState::Succeeded);
                    let _ = tx
                        .send(FailoverEvent::Succeeded {
                            provider: id.clone(),
                        })
                        .await;
                    return FailoverResult {
                        outcome: FailoverOutcome::Succeeded {
                            provider: id,
                            output,
                        },
                        attempts,
                    };
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => Error::Timeout {
                    operation: "call",
                    after: timeout,
                }
                .to_string(),
            };

            warn!(provider = %id, error = %error, "provider call failed, failing over");
            health.invalidate(&id).await;
            Self::settle(&mut attempts, AttemptState::Failed { error: error.clone() });
            let _ = tx
                .send(FailoverEvent::ProviderFailed { provider: id, error })
                .await;
        }

        FailoverResult {
            outcome: FailoverOutcome::Exhausted,
            attempts,
        }
    }

    async fn dispatch(
        provider: &dyn GenerationProvider,
        payload: &JobPayload,
        sink: &ProgressSink,
    ) -> ProviderResult<JobOutput> {
        match payload {
            JobPayload::Generation(request) => {
                provider.generate(request, sink).await.map(JobOutput::Assets)
            }
            JobPayload::StylePack(request) => provider
                .train_style(request, sink)
                .await
                .map(JobOutput::StylePack),
        }
    }

    /// True once the job is cancelled, locally or through `check`.
    async fn checkpoint(cancel: &CancellationToken, check: Option<&dyn CancelCheck>) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        match check {
            Some(check) if check.is_cancelled().await => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Record the state of the attempt in progress.
    fn settle(attempts: &mut [ProviderAttempt], state: AttemptState) {
        if let Some(current) = attempts.last_mut() {
            current.state = state;
        }
    }

    fn cancelled(mut attempts: Vec<ProviderAttempt>) -> FailoverResult {
        // The interrupted attempt never reached a verdict.
        if attempts.last().is_some_and(|a| !a.state.is_terminal()) {
            attempts.pop();
        }
        FailoverResult {
            outcome: FailoverOutcome::Cancelled,
            attempts,
        }
    }
}

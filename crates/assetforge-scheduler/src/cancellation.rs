//! Cancellation tokens for jobs running on this node.

use assetforge_core::JobId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Tokens for in-flight jobs, keyed by job id.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<JobId, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The map stays consistent across a panicking holder: every critical
    /// section is a single insert, remove or lookup.
    fn tokens(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job as running here and return its token.
    pub fn register(&self, job_id: JobId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens().insert(job_id, token.clone());
        token
    }

    /// Signal the job's worker. Returns false if the job is not running here.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let token = self.tokens().get(&job_id).cloned();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, job_id: JobId) {
        self.tokens().remove(&job_id);
    }

    pub fn len(&self) -> usize {
        self.tokens().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_signals_registered_token() {
        let registry = CancellationRegistry::new();
        let id = JobId::new();
        let token = registry.register(id);

        assert!(registry.cancel(id));
        assert!(token.is_cancelled());

        registry.remove(id);
        assert!(!registry.cancel(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn survives_a_poisoned_lock() {
        let registry = std::sync::Arc::new(CancellationRegistry::new());
        let id = JobId::new();
        let token = registry.register(id);

        let poisoner = registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.tokens.lock().unwrap();
            panic!("holder panicked");
        })
        .join();
        assert!(registry.tokens.is_poisoned());

        assert!(registry.cancel(id));
        assert!(token.is_cancelled());
        let other = JobId::new();
        registry.register(other);
        assert_eq!(registry.len(), 2);
    }
}

//! Cancellation signalling and per-execution serialization for step advances

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Cancellation tokens of the advances currently running, keyed by chain id
#[derive(Debug, Default)]
pub struct InFlightAdvances {
    tokens: DashMap<String, CancellationToken>,
}

impl InFlightAdvances {
    pub fn register(&self, chain_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(chain_id.to_string(), token.clone());
        token
    }

    pub fn remove(&self, chain_id: &str) {
        self.tokens.remove(chain_id);
    }

    /// Returns true if an advance was running for `chain_id`
    pub fn cancel(&self, chain_id: &str) -> bool {
        match self.tokens.get(chain_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Per-execution async locks so that only one advance of an execution runs at a time
#[derive(Debug, Default)]
pub struct ExecutionLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ExecutionLocks {
    pub async fn acquire(&self, chain_id: &str) -> OwnedMutexGuard<()> {
        // The map guard is released before awaiting the execution lock
        let lock = self
            .locks
            .entry(chain_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lock entry of an execution that will never advance again
    pub fn release(&self, chain_id: &str) {
        self.locks.remove(chain_id);
    }
}

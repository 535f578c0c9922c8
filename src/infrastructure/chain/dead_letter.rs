//! In-memory dead-letter queue

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::domain::chain::{DeadLetterEntry, DeadLetterSink};
use crate::domain::DomainError;

#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterQueue {
    entries: Arc<RwLock<Vec<DeadLetterEntry>>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the stored entries, oldest first
    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterQueue {
    async fn push(&self, entry: DeadLetterEntry) -> Result<(), DomainError> {
        warn!(
            chain_id = %entry.chain_id,
            step = %entry.step,
            error = %entry.error,
            "Step routed to dead-letter queue"
        );
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn drain(&self) -> Result<Vec<DeadLetterEntry>, DomainError> {
        let mut entries = self.entries.write().await;
        Ok(std::mem::take(&mut *entries))
    }

    async fn len(&self) -> Result<usize, DomainError> {
        Ok(self.entries.read().await.len())
    }
}

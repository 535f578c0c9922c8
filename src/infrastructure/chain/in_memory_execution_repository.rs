//! In-memory chain execution repository

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::chain::{ChainExecution, ChainExecutionRepository, ChainId, ExecutionFilter};
use crate::domain::DomainError;

/// In-memory implementation of ChainExecutionRepository with revision checks
#[derive(Debug, Clone)]
pub struct InMemoryChainExecutionRepository {
    executions: Arc<RwLock<HashMap<String, ChainExecution>>>,
}

impl InMemoryChainExecutionRepository {
    /// Create a new empty repository
    pub fn new() -> Self {
        Self {
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryChainExecutionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainExecutionRepository for InMemoryChainExecutionRepository {
    async fn get(&self, id: &ChainId) -> Result<Option<ChainExecution>, DomainError> {
        let executions = self.executions.read().await;
        Ok(executions.get(id.as_str()).cloned())
    }

    async fn create(&self, execution: ChainExecution) -> Result<ChainExecution, DomainError> {
        let mut executions = self.executions.write().await;
        let id = execution.chain_id().as_str().to_string();

        if executions.contains_key(&id) {
            return Err(DomainError::conflict(format!(
                "Execution '{}' already exists",
                id
            )));
        }

        executions.insert(id, execution.clone());
        Ok(execution)
    }

    async fn update(&self, mut execution: ChainExecution) -> Result<ChainExecution, DomainError> {
        let mut executions = self.executions.write().await;
        let id = execution.chain_id().as_str().to_string();

        let Some(stored) = executions.get(&id) else {
            return Err(DomainError::not_found(format!(
                "Execution '{}' not found",
                id
            )));
        };

        if stored.revision() != execution.revision() {
            return Err(DomainError::conflict(format!(
                "Execution '{}' was modified concurrently (expected revision {}, found {})",
                id,
                execution.revision(),
                stored.revision()
            )));
        }

        execution.set_revision(stored.revision() + 1);
        executions.insert(id, execution.clone());
        Ok(execution)
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ChainExecution>, DomainError> {
        let executions = self.executions.read().await;
        let mut list: Vec<ChainExecution> = executions
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        list.sort_by_key(|e| e.started_at());
        Ok(list)
    }
}

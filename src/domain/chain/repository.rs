//! Storage ports for chain definitions and executions

use std::fmt::Debug;

use async_trait::async_trait;

use super::definition::ChainDefinition;
use super::execution::{ChainExecution, ChainId, ExecutionFilter};
use crate::domain::error::DomainError;

/// Read-only lookup of validated chain definitions
#[async_trait]
pub trait ChainDefinitionRepository: Send + Sync + Debug {
    async fn get(&self, name: &str) -> Result<Option<ChainDefinition>, DomainError>;

    async fn list(&self) -> Result<Vec<ChainDefinition>, DomainError>;
}

/// Keyed storage for executions with per-record conditional updates
#[async_trait]
pub trait ChainExecutionRepository: Send + Sync + Debug {
    async fn get(&self, id: &ChainId) -> Result<Option<ChainExecution>, DomainError>;

    /// Insert a new execution; returns `Conflict` if the id already exists
    async fn create(&self, execution: ChainExecution) -> Result<ChainExecution, DomainError>;

    /// Write `execution` only if the stored revision still equals
    /// `execution.revision()`. Returns the stored copy with its new revision,
    /// or `Conflict` when another writer got there first.
    async fn update(&self, execution: ChainExecution) -> Result<ChainExecution, DomainError>;

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ChainExecution>, DomainError>;
}

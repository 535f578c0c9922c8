//! In-memory chain definition repository

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::chain::{validate_definitions, ChainDefinition, ChainDefinitionRepository, ChainError};
use crate::domain::DomainError;

/// Holds a validated, read-only set of definitions
#[derive(Debug)]
pub struct InMemoryChainDefinitionRepository {
    definitions: Arc<RwLock<HashMap<String, ChainDefinition>>>,
}

impl InMemoryChainDefinitionRepository {
    /// Create a new empty repository
    pub fn new() -> Self {
        Self {
            definitions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validate the whole set and build a repository from it
    pub fn with_definitions(
        definitions: Vec<ChainDefinition>,
        max_sub_chain_depth: usize,
    ) -> Result<Self, ChainError> {
        validate_definitions(&definitions, max_sub_chain_depth)?;

        let map: HashMap<String, ChainDefinition> = definitions
            .into_iter()
            .map(|d| (d.name().to_string(), d))
            .collect();

        Ok(Self {
            definitions: Arc::new(RwLock::new(map)),
        })
    }
}

impl Default for InMemoryChainDefinitionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainDefinitionRepository for InMemoryChainDefinitionRepository {
    async fn get(&self, name: &str) -> Result<Option<ChainDefinition>, DomainError> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<ChainDefinition>, DomainError> {
        let definitions = self.definitions.read().await;
        let mut list: Vec<ChainDefinition> = definitions.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(list)
    }
}

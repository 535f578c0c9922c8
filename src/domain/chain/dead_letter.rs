//! Dead-letter port for failed steps

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::error::DomainError;

/// Context of a failed step kept for out-of-band inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub chain_id: String,
    pub chain_name: String,
    pub namespace: String,
    pub tenant: String,
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    /// Rendered payload of the failed attempt
    pub payload: Value,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync + std::fmt::Debug {
    async fn push(&self, entry: DeadLetterEntry) -> Result<(), DomainError>;

    /// Remove and return every stored entry
    async fn drain(&self) -> Result<Vec<DeadLetterEntry>, DomainError>;

    async fn len(&self) -> Result<usize, DomainError>;

    async fn is_empty(&self) -> Result<bool, DomainError> {
        Ok(self.len().await? == 0)
    }
}

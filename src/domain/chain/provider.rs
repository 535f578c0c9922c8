//! Provider dispatch port

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::error::DomainError;

#[cfg(test)]
use mockall::automock;

/// A rendered action ready to be sent to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub provider: String,
    pub action_type: String,
    pub payload: Value,
    pub chain_id: String,
    pub namespace: String,
    pub tenant: String,
}

impl ProviderRequest {
    pub fn new(
        provider: impl Into<String>,
        action_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            provider: provider.into(),
            action_type: action_type.into(),
            payload,
            chain_id: String::new(),
            namespace: String::new(),
            tenant: String::new(),
        }
    }

    pub fn with_origin(
        mut self,
        chain_id: impl Into<String>,
        namespace: impl Into<String>,
        tenant: impl Into<String>,
    ) -> Self {
        self.chain_id = chain_id.into();
        self.namespace = namespace.into();
        self.tenant = tenant.into();
        self
    }
}

/// Sends actions to external providers (messaging, paging, cloud APIs)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderDispatcher: Send + Sync {
    /// Invoke the provider once and return its response body
    async fn invoke(&self, request: ProviderRequest) -> Result<Value, DomainError>;
}

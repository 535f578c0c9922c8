//! HTTP provider dispatcher
//!
//! Each provider is an HTTP endpoint receiving a JSON POST of
//! `{action_type, payload, chain_id, namespace, tenant}`. A 2xx response with
//! a JSON body (or an empty body) is a success.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ProviderEndpointConfig;
use crate::domain::chain::{ProviderDispatcher, ProviderRequest};
use crate::domain::DomainError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub url: String,
    pub timeout: Duration,
    pub headers: HashMap<String, String>,
}

impl ProviderEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(30),
            headers: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl From<&ProviderEndpointConfig> for ProviderEndpoint {
    fn from(config: &ProviderEndpointConfig) -> Self {
        Self {
            url: config.url.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            headers: config.headers.clone(),
        }
    }
}

/// Dispatches provider requests over HTTP using reqwest
#[derive(Debug, Clone)]
pub struct HttpProviderDispatcher {
    client: reqwest::Client,
    endpoints: HashMap<String, ProviderEndpoint>,
}

impl HttpProviderDispatcher {
    pub fn new(endpoints: HashMap<String, ProviderEndpoint>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    pub fn from_config(providers: &HashMap<String, ProviderEndpointConfig>) -> Self {
        Self::new(
            providers
                .iter()
                .map(|(name, config)| (name.clone(), ProviderEndpoint::from(config)))
                .collect(),
        )
    }

    pub fn with_endpoint(mut self, provider: impl Into<String>, endpoint: ProviderEndpoint) -> Self {
        self.endpoints.insert(provider.into(), endpoint);
        self
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }
}

#[async_trait]
impl ProviderDispatcher for HttpProviderDispatcher {
    async fn invoke(&self, request: ProviderRequest) -> Result<Value, DomainError> {
        let endpoint = self.endpoints.get(&request.provider).ok_or_else(|| {
            DomainError::configuration(format!(
                "No endpoint configured for provider '{}'",
                request.provider
            ))
        })?;

        let body = json!({
            "action_type": request.action_type,
            "payload": request.payload,
            "chain_id": request.chain_id,
            "namespace": request.namespace,
            "tenant": request.tenant,
        });

        let mut http_request = self
            .client
            .post(&endpoint.url)
            .timeout(endpoint.timeout)
            .header("x-chain-id", &request.chain_id);

        for (name, value) in &endpoint.headers {
            http_request = http_request.header(name, value);
        }

        debug!(
            provider = %request.provider,
            action_type = %request.action_type,
            url = %endpoint.url,
            "Dispatching provider request"
        );

        let response = http_request.json(&body).send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("Request timed out after {:?}", endpoint.timeout)
            } else {
                format!("Request failed: {}", e)
            };
            DomainError::provider(&request.provider, message)
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            DomainError::provider(&request.provider, format!("Failed to read response: {}", e))
        })?;

        if !status.is_success() {
            return Err(DomainError::provider(
                &request.provider,
                format!("HTTP status {}: {}", status.as_u16(), text),
            ));
        }

        if text.trim().is_empty() {
            return Ok(json!({}));
        }

        serde_json::from_str(&text).map_err(|e| {
            DomainError::provider(&request.provider, format!("Failed to parse response: {}", e))
        })
    }
}

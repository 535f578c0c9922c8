//! Step evaluator: renders payloads and invokes providers with retry

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EvaluatorConfig;
use crate::domain::chain::{ProviderDispatcher, ProviderRequest};
use crate::domain::DomainError;

/// Exponential backoff for provider invocations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 200,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, ms: u64) -> Self {
        self.initial_delay_ms = ms;
        self
    }

    pub fn with_max_delay(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

impl From<&EvaluatorConfig> for RetryPolicy {
    fn from(config: &EvaluatorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

/// Single surfaced result of a provider invocation, retries included
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub success: bool,
    pub body: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl StepOutcome {
    pub fn success(body: Value, attempts: u32) -> Self {
        Self {
            success: true,
            body: Some(body),
            error: None,
            attempts,
        }
    }

    pub fn failure(error: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: false,
            body: None,
            error: Some(error.into()),
            attempts,
        }
    }
}

pub struct StepEvaluator {
    dispatcher: Arc<dyn ProviderDispatcher>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl std::fmt::Debug for StepEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepEvaluator")
            .field("retry", &self.retry)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

impl StepEvaluator {
    pub fn new(dispatcher: Arc<dyn ProviderDispatcher>) -> Self {
        Self {
            dispatcher,
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(dispatcher: Arc<dyn ProviderDispatcher>, config: &EvaluatorConfig) -> Self {
        Self::new(dispatcher)
            .with_retry(RetryPolicy::from(config))
            .with_attempt_timeout(Duration::from_secs(config.attempt_timeout_seconds.max(1)))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Invoke a provider, retrying transient failures with backoff
    pub async fn invoke(&self, request: ProviderRequest) -> StepOutcome {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let error = match self.attempt(request.clone()).await {
                Ok(body) => return StepOutcome::success(body, attempts),
                Err(error) => error,
            };

            let retryable = !matches!(
                error,
                DomainError::Configuration { .. } | DomainError::Validation { .. }
            );

            if !retryable || attempts > self.retry.max_retries {
                warn!(
                    provider = %request.provider,
                    action_type = %request.action_type,
                    attempts = attempts,
                    error = %error,
                    "Provider invocation failed"
                );
                return StepOutcome::failure(error.to_string(), attempts);
            }

            let delay = self.retry.delay_for_attempt(attempts - 1);
            debug!(
                provider = %request.provider,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying provider invocation"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Fire a best-effort notification: one attempt, no retry
    pub async fn notify(&self, request: ProviderRequest) -> Result<Value, DomainError> {
        self.attempt(request).await
    }

    async fn attempt(&self, request: ProviderRequest) -> Result<Value, DomainError> {
        let provider = request.provider.clone();
        match tokio::time::timeout(self.attempt_timeout, self.dispatcher.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::provider(
                provider,
                format!(
                    "attempt timed out after {}ms",
                    self.attempt_timeout.as_millis()
                ),
            )),
        }
    }
}

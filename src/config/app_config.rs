use std::collections::HashMap;

use serde::Deserialize;

use crate::infrastructure::observability::ObservabilityConfig;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    /// HTTP endpoints keyed by provider name
    #[serde(default)]
    pub providers: HashMap<String, ProviderEndpointConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Chain engine tuning
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// TOML file holding the chain definitions
    #[serde(default = "default_definitions_path")]
    pub definitions_path: String,
    #[serde(default = "default_max_concurrent_advances")]
    pub max_concurrent_advances: usize,
    #[serde(default = "default_max_steps_per_execution")]
    pub max_steps_per_execution: usize,
    #[serde(default = "default_max_sub_chain_depth")]
    pub max_sub_chain_depth: usize,
    #[serde(default = "default_timeout_sweep_interval_seconds")]
    pub timeout_sweep_interval_seconds: u64,
    #[serde(default = "default_storage_retry_seconds")]
    pub storage_retry_seconds: u64,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

/// Provider invocation retry policy
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_attempt_timeout_seconds")]
    pub attempt_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEndpointConfig {
    pub url: String,
    #[serde(default = "default_provider_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_definitions_path() -> String {
    "config/chains.toml".to_string()
}

fn default_max_concurrent_advances() -> usize {
    16
}

fn default_max_steps_per_execution() -> usize {
    100
}

fn default_max_sub_chain_depth() -> usize {
    8
}

fn default_timeout_sweep_interval_seconds() -> u64 {
    5
}

fn default_storage_retry_seconds() -> u64 {
    5
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_attempt_timeout_seconds() -> u64 {
    30
}

fn default_provider_timeout_seconds() -> u64 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            definitions_path: default_definitions_path(),
            max_concurrent_advances: default_max_concurrent_advances(),
            max_steps_per_execution: default_max_steps_per_execution(),
            max_sub_chain_depth: default_max_sub_chain_depth(),
            timeout_sweep_interval_seconds: default_timeout_sweep_interval_seconds(),
            storage_retry_seconds: default_storage_retry_seconds(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            attempt_timeout_seconds: default_attempt_timeout_seconds(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

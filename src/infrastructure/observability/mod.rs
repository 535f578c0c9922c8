//! Observability infrastructure - Tracing, Metrics, and Logging

mod config;
mod metrics;
mod tracing_setup;

pub use config::{MetricsConfig, ObservabilityConfig, TracingConfig};
pub use metrics::{
    init_metrics, record_dead_letter, record_execution_finished, record_execution_started,
    record_step_attempt, record_timeout,
};
pub use tracing_setup::{init_tracing, shutdown_tracing};

//! Prometheus metrics for the chain engine

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use super::config::MetricsConfig;

/// Install the Prometheus recorder with its own scrape listener.
/// Returns false when metrics are disabled or the exporter could not start.
pub fn init_metrics(config: &MetricsConfig) -> bool {
    if !config.enabled {
        tracing::info!("Prometheus metrics disabled");
        return false;
    }

    let address: SocketAddr = match config.listen_address.parse() {
        Ok(address) => address,
        Err(e) => {
            tracing::error!(
                listen_address = %config.listen_address,
                "Invalid metrics listen address: {}",
                e
            );
            return false;
        }
    };

    match PrometheusBuilder::new().with_http_listener(address).install() {
        Ok(()) => {
            register_default_metrics();
            tracing::info!("Prometheus metrics listening on {}", address);
            true
        }
        Err(e) => {
            tracing::error!("Failed to initialize Prometheus metrics: {}", e);
            false
        }
    }
}

fn register_default_metrics() {
    gauge!("action_gateway_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

pub fn record_execution_started(chain: &str) {
    counter!("chain_executions_started_total", "chain" => chain.to_string()).increment(1);
}

/// Record an execution reaching a terminal status
pub fn record_execution_finished(chain: &str, status: &str) {
    let labels = [
        ("chain", chain.to_string()),
        ("status", status.to_string()),
    ];
    counter!("chain_executions_finished_total", &labels).increment(1);
}

/// Record one step attempt of any kind
pub fn record_step_attempt(chain: &str, kind: &str, success: bool, duration: Duration) {
    let outcome = if success { "success" } else { "failure" };

    counter!(
        "chain_step_attempts_total",
        "chain" => chain.to_string(),
        "kind" => kind.to_string(),
        "outcome" => outcome
    )
    .increment(1);

    histogram!(
        "chain_step_duration_seconds",
        "chain" => chain.to_string(),
        "kind" => kind.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_dead_letter(chain: &str) {
    counter!("chain_dead_letters_total", "chain" => chain.to_string()).increment(1);
}

pub fn record_timeout() {
    counter!("chain_timeouts_total").increment(1);
}

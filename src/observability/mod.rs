// src/observability/mod.rs
//! Tracing and metrics setup
//!
//! Metric names used across the crate live here so dashboards have a single
//! place to look them up.

use crate::utils::config::ObservabilityConfig;
use crate::utils::errors::{InspectorError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const EXCHANGES_TOTAL: &str = "inspector_exchanges_total";
pub const INTERRUPTIONS_TOTAL: &str = "inspector_interruptions_total";
pub const ENGINE_ERRORS_TOTAL: &str = "inspector_engine_errors_total";
pub const FORWARDING_ERRORS_TOTAL: &str = "inspector_forwarding_errors_total";
pub const SESSION_RELEASE_FAILURES_TOTAL: &str = "inspector_session_release_failures_total";
pub const EXCHANGE_DURATION_SECONDS: &str = "inspector_exchange_duration_seconds";

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match config.log_format.as_str() {
        "json" => builder.json().try_init(),
        "pretty" => builder.try_init(),
        other => {
            return Err(InspectorError::ConfigError(format!(
                "Unknown log format: {}",
                other
            )))
        }
    };

    installed.map_err(|e| InspectorError::ConfigError(format!("Tracing init failed: {}", e)))
}

/// Install the Prometheus exporter when a scrape address is configured
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(addr) = config.metrics_addr else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| InspectorError::ConfigError(format!("Metrics init failed: {}", e)))?;

    info!("Prometheus metrics exposed on {}", addr);
    Ok(())
}

// src/observability/mod.rs
//! Logging and metrics setup
//!
//! - **Tracing**: `tracing-subscriber` with `RUST_LOG` filtering; set
//!   `FLEET_LOG_FORMAT=json` for structured output
//! - **Metrics**: Prometheus exporter, installed only when an address is configured

pub mod metrics;

use crate::utils::config::ObservabilityConfig;
use crate::utils::errors::{FleetError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FLEET_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| FleetError::ConfigError(format!("Failed to install tracing subscriber: {}", e)))
}

/// Install the Prometheus exporter if a listen address is configured
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(addr) = config.metrics_address else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| FleetError::ConfigError(format!("Failed to install metrics exporter: {}", e)))?;

    metrics::describe();
    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

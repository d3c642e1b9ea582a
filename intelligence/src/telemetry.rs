//! Logging and metrics setup

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{IntelligenceError, Result};

pub const PREDICTIONS_TOTAL: &str = "predictions_total";
pub const PREDICTION_ERRORS_TOTAL: &str = "prediction_errors_total";
pub const PREDICTION_SCORE: &str = "prediction_score";
pub const FEATURE_STORE_READS_TOTAL: &str = "feature_store_reads_total";
pub const FEATURE_STORE_FALLBACKS_TOTAL: &str = "feature_store_fallbacks_total";
pub const MODEL_CACHE_LOADS_TOTAL: &str = "model_cache_loads_total";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = IntelligenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(IntelligenceError::InvalidRequest(format!("Unknown log format: {}", other))),
        }
    }
}

fn level_directive(log_level: &str) -> tracing::Level {
    match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            tracing::Level::INFO
        }
    }
}

/// Initialize logging. `RUST_LOG` wins over `log_level` when set.
pub fn init_logging(log_level: &str, format: LogFormat) {
    let level = level_directive(log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "poolsentry_intelligence={},intelligence={},poolsentry_dataplane={}",
            level, level, level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

/// Install the Prometheus exporter and describe the scoring metrics
pub fn install_metrics_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| IntelligenceError::internal(format!("failed to install Prometheus exporter: {}", e)))?;

    describe_counter!(PREDICTIONS_TOTAL, "Pools scored, labelled by verdict");
    describe_counter!(PREDICTION_ERRORS_TOTAL, "Scoring requests that returned an error result");
    describe_histogram!(PREDICTION_SCORE, "Anomaly score of scored pools");
    describe_counter!(FEATURE_STORE_READS_TOTAL, "Online feature reads by mode and outcome");
    describe_counter!(FEATURE_STORE_FALLBACKS_TOTAL, "Batch reads that fell back to per-entity reads");
    describe_counter!(MODEL_CACHE_LOADS_TOTAL, "Model artifacts loaded from disk");

    info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

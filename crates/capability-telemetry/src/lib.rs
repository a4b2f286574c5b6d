//! # Capability Telemetry
//!
//! Observability for the capability bus.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` with an env filter and either pretty
//!   or JSON output
//! - **Metrics**: a Prometheus registry owned by the node (not process-global)
//!   holding the dispatcher's counters and gauges
//!
//! ## Usage
//!
//! ```rust,ignore
//! use capability_telemetry::{init_logging, CapabilityMetrics, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_logging(&config)?;
//! let metrics = CapabilityMetrics::new(&config.metrics_namespace)?;
//! // hand `metrics` to the dispatcher, serve `metrics.encode()` on /metrics
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CAPBUS_SERVICE_NAME` | `capability-bus` | Service name attached to logs |
//! | `CAPBUS_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `CAPBUS_CONSOLE_OUTPUT` | `true` | Emit logs to stdout |
//! | `CAPBUS_JSON_LOGS` | `false` | JSON formatted logs |
//! | `CAPBUS_METRICS_NAMESPACE` | `capbus` | Prefix for metric names |

mod config;
mod logging;
mod metrics;

pub use config::TelemetryConfig;
pub use logging::{init_logging, init_test_logging};
pub use metrics::CapabilityMetrics;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Failed to encode metrics: {0}")]
    MetricsEncode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for logging and metrics.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error) or a full
    /// `EnvFilter` directive such as `capability_bus=debug,info`
    pub log_level: String,

    /// Whether to emit logs to stdout
    pub console_output: bool,

    /// Whether to format logs as JSON
    pub json_logs: bool,

    /// Prefix for Prometheus metric names
    pub metrics_namespace: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "capability-bus".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
            metrics_namespace: "capbus".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CAPBUS_SERVICE_NAME`: Service name (default: capability-bus)
    /// - `CAPBUS_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `CAPBUS_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `CAPBUS_JSON_LOGS`: Enable JSON logs (default: false in dev, true in containers)
    /// - `CAPBUS_METRICS_NAMESPACE`: Metric name prefix (default: capbus)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("CAPBUS_SERVICE_NAME")
                .unwrap_or_else(|_| "capability-bus".to_string()),

            log_level: env::var("CAPBUS_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: env::var("CAPBUS_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),

            json_logs: env::var("CAPBUS_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(is_container),

            metrics_namespace: env::var("CAPBUS_METRICS_NAMESPACE")
                .unwrap_or_else(|_| "capbus".to_string()),
        }
    }

    /// Configuration for a named node, e.g. `capability-bus-node-3`.
    pub fn for_node(node_name: &str) -> Self {
        let mut config = Self::from_env();
        config.service_name = format!("capability-bus-{node_name}");
        config
    }
}

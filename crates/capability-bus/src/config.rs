//! Dispatcher configuration.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared_types::RateLimiterConfig;

use crate::errors::ConfigError;
use crate::{DEFAULT_RECEIVER_BUFFER_SIZE, PROTOCOL_VERSION};

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Version stamped on outbound bodies and required on inbound ones.
    pub supported_version: u32,
    /// Capacity of each per-key receive queue.
    pub receiver_buffer_size: usize,
    /// Inbound admission limits.
    pub rate_limit: RateLimiterConfig,
    /// How often idle per-sender limiter entries are swept.
    pub rate_limit_cleanup_interval: Duration,
    /// Per-sender limiter entries unused for this long are dropped.
    pub sender_idle_timeout: Duration,
    /// Route outbound messages through the shared peer instead of the
    /// primary one.
    pub send_to_shared_peer: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            supported_version: PROTOCOL_VERSION,
            receiver_buffer_size: DEFAULT_RECEIVER_BUFFER_SIZE,
            rate_limit: RateLimiterConfig::default(),
            rate_limit_cleanup_interval: Duration::from_secs(60),
            sender_idle_timeout: Duration::from_secs(300),
            send_to_shared_peer: false,
        }
    }
}

impl DispatcherConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CAPBUS_SUPPORTED_VERSION`: Protocol version (default: 1)
    /// - `CAPBUS_RECEIVER_BUFFER_SIZE`: Per-key queue capacity (default: 10000)
    /// - `CAPBUS_RATE_LIMIT_GLOBAL_RPS`: Global refill rate (default: 800)
    /// - `CAPBUS_RATE_LIMIT_GLOBAL_BURST`: Global bucket size (default: 1000)
    /// - `CAPBUS_RATE_LIMIT_PER_SENDER_RPS`: Per-sender refill rate (default: 100)
    /// - `CAPBUS_RATE_LIMIT_PER_SENDER_BURST`: Per-sender bucket size (default: 100)
    /// - `CAPBUS_RATE_LIMIT_CLEANUP_SECS`: Idle sender sweep period (default: 60)
    /// - `CAPBUS_SENDER_IDLE_TIMEOUT_SECS`: Idle sender retention (default: 300)
    /// - `CAPBUS_SEND_TO_SHARED_PEER`: Send via the shared peer (default: false)
    ///
    /// Unset variables keep their defaults; unparsable ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            supported_version: parse_var("CAPBUS_SUPPORTED_VERSION", defaults.supported_version)?,
            receiver_buffer_size: parse_var(
                "CAPBUS_RECEIVER_BUFFER_SIZE",
                defaults.receiver_buffer_size,
            )?,
            rate_limit: RateLimiterConfig {
                global_rps: parse_var(
                    "CAPBUS_RATE_LIMIT_GLOBAL_RPS",
                    defaults.rate_limit.global_rps,
                )?,
                global_burst: parse_var(
                    "CAPBUS_RATE_LIMIT_GLOBAL_BURST",
                    defaults.rate_limit.global_burst,
                )?,
                per_sender_rps: parse_var(
                    "CAPBUS_RATE_LIMIT_PER_SENDER_RPS",
                    defaults.rate_limit.per_sender_rps,
                )?,
                per_sender_burst: parse_var(
                    "CAPBUS_RATE_LIMIT_PER_SENDER_BURST",
                    defaults.rate_limit.per_sender_burst,
                )?,
            },
            rate_limit_cleanup_interval: Duration::from_secs(parse_var(
                "CAPBUS_RATE_LIMIT_CLEANUP_SECS",
                defaults.rate_limit_cleanup_interval.as_secs(),
            )?),
            sender_idle_timeout: Duration::from_secs(parse_var(
                "CAPBUS_SENDER_IDLE_TIMEOUT_SECS",
                defaults.sender_idle_timeout.as_secs(),
            )?),
            send_to_shared_peer: env::var("CAPBUS_SEND_TO_SHARED_PEER")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(defaults.send_to_shared_peer),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receiver_buffer_size == 0 {
            return Err(ConfigError::ZeroReceiverBuffer);
        }
        if self.rate_limit_cleanup_interval.is_zero() {
            return Err(ConfigError::ZeroCleanupInterval);
        }
        self.rate_limit.validate()?;
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(default),
    }
}

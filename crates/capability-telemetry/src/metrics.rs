//! Prometheus metrics for the capability bus.
//!
//! All metrics follow the naming convention: `<namespace>_<component>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: messages received per transport, messages dropped per reason
//! - **Gauge**: receive queue occupancy per (capability, DON), 0.0 empty to 1.0 full

use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::TelemetryError;

/// Dispatcher metrics registered on an owned registry.
///
/// Cloning is cheap and every clone records into the same series.
#[derive(Clone)]
pub struct CapabilityMetrics {
    registry: Registry,
    messages_received: IntCounterVec,
    messages_dropped: IntCounterVec,
    receive_channel_usage: GaugeVec,
}

impl CapabilityMetrics {
    /// Create and register all metrics under `namespace`.
    pub fn new(namespace: &str) -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        let messages_received = IntCounterVec::new(
            Opts::new(
                "dispatcher_msgs_received_total",
                "Messages received by the dispatcher, per transport",
            )
            .namespace(namespace),
            &["transport"],
        )
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

        let messages_dropped = IntCounterVec::new(
            Opts::new(
                "dispatcher_msgs_dropped_total",
                "Inbound messages dropped by the dispatcher, per reason",
            )
            .namespace(namespace),
            &["reason"],
        )
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

        let receive_channel_usage = GaugeVec::new(
            Opts::new(
                "capability_receive_channel_usage",
                "The usage of the receive channel for each capability, 0 indicates empty, 1 indicates full.",
            )
            .namespace(namespace),
            &["capability_id", "don_id"],
        )
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

        let collectors: [Box<dyn prometheus::core::Collector>; 3] = [
            Box::new(messages_received.clone()),
            Box::new(messages_dropped.clone()),
            Box::new(receive_channel_usage.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        }

        Ok(Self {
            registry,
            messages_received,
            messages_dropped,
            receive_channel_usage,
        })
    }

    pub fn inc_messages_received(&self, transport: &str) {
        self.messages_received.with_label_values(&[transport]).inc();
    }

    pub fn inc_messages_dropped(&self, reason: &str) {
        self.messages_dropped.with_label_values(&[reason]).inc();
    }

    pub fn set_receive_channel_usage(&self, capability_id: &str, don_id: u32, usage: f64) {
        self.receive_channel_usage
            .with_label_values(&[capability_id, &don_id.to_string()])
            .set(usage);
    }

    pub fn messages_received(&self, transport: &str) -> u64 {
        self.messages_received.with_label_values(&[transport]).get()
    }

    pub fn messages_dropped(&self, reason: &str) -> u64 {
        self.messages_dropped.with_label_values(&[reason]).get()
    }

    pub fn receive_channel_usage(&self, capability_id: &str, don_id: u32) -> f64 {
        self.receive_channel_usage
            .with_label_values(&[capability_id, &don_id.to_string()])
            .get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode all metrics as Prometheus text format.
    pub fn encode(&self) -> Result<String, TelemetryError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| TelemetryError::MetricsEncode(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsEncode(e.to_string()))
    }
}

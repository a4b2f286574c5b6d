//! Metrics adapters.

use capability_telemetry::CapabilityMetrics;
use shared_types::DonId;

use crate::ports::outbound::{DispatcherMetrics, DropReason, TransportKind};

impl DispatcherMetrics for CapabilityMetrics {
    fn inc_messages_received(&self, transport: TransportKind) {
        CapabilityMetrics::inc_messages_received(self, transport.as_str());
    }

    fn inc_messages_dropped(&self, reason: DropReason) {
        CapabilityMetrics::inc_messages_dropped(self, reason.as_str());
    }

    fn set_receive_queue_usage(&self, capability_id: &str, don_id: DonId, usage: f64) {
        self.set_receive_channel_usage(capability_id, don_id, usage);
    }
}

/// Discards all measurements.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl DispatcherMetrics for NoopMetrics {
    fn inc_messages_received(&self, _transport: TransportKind) {}

    fn inc_messages_dropped(&self, _reason: DropReason) {}

    fn set_receive_queue_usage(&self, _capability_id: &str, _don_id: DonId, _usage: f64) {}
}

//! Cross-node integration tests.

mod dispatch;
mod executable_flows;
mod trigger_flows;

use std::sync::Arc;

use capability_bus::test_utils::peer_of;
use capability_bus::{
    DispatcherConfig, DispatcherService, Ed25519Signer, InMemoryNetwork, InMemoryTransport,
};
use capability_telemetry::CapabilityMetrics;
use shared_crypto::Ed25519KeyPair;
use shared_types::PeerId;

/// One node: a started dispatcher on the shared network.
pub struct Node {
    pub id: PeerId,
    pub dispatcher: Arc<DispatcherService>,
    pub transport: Arc<InMemoryTransport>,
    pub metrics: CapabilityMetrics,
}

/// Join `network` as `key` and start a dispatcher. Must run inside a
/// Tokio runtime.
pub fn spawn_node(network: &InMemoryNetwork, key: Ed25519KeyPair) -> Node {
    capability_telemetry::init_test_logging();
    let id = peer_of(&key);
    let transport = network.join(id);
    let metrics = CapabilityMetrics::new("capbus").unwrap();
    let dispatcher = Arc::new(
        DispatcherService::new(DispatcherConfig::default(), Arc::new(Ed25519Signer::new(key)))
            .unwrap()
            .with_primary_transport(transport.clone())
            .with_metrics(Arc::new(metrics.clone())),
    );
    dispatcher.start().unwrap();
    Node {
        id,
        dispatcher,
        transport,
        metrics,
    }
}

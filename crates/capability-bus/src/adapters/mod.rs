//! Adapters for the outbound ports.

pub mod ed25519_signer;
pub mod memory_transport;
pub mod metrics;

pub use ed25519_signer::Ed25519Signer;
pub use memory_transport::{InMemoryNetwork, InMemoryTransport};
pub use metrics::NoopMetrics;

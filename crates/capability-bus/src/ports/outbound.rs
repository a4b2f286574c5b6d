//! Outbound ports: peer transport, signing, metrics and time.

use async_trait::async_trait;
use shared_crypto::CryptoError;
use shared_types::{DonId, PeerId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Timestamp in milliseconds since Unix epoch.
pub type Timestamp = i64;

// =============================================================================
// TRANSPORT
// =============================================================================

/// A raw message as delivered by a peer transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Authenticated transport-level sender.
    pub sender: PeerId,
    /// Encoded signed envelope.
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not reachable")]
    PeerUnreachable(PeerId),

    #[error("transport closed")]
    Closed,
}

/// Authenticated point-to-point transport between cluster nodes.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Local peer identity.
    fn id(&self) -> PeerId;

    /// Deliver `payload` to `peer`.
    async fn send(&self, peer: PeerId, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Take the inbound stream. Returns `None` once it has been taken.
    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>>;
}

// =============================================================================
// SIGNING
// =============================================================================

/// Signs outbound message bodies with the node's peer key.
pub trait Signer: Send + Sync {
    /// Load key material. Called once by the dispatcher on start.
    fn initialize(&self) -> Result<(), CryptoError>;

    /// Sign `data`, returning the raw signature bytes.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

// =============================================================================
// METRICS
// =============================================================================

/// Which transport a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Primary,
    Shared,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Primary => "primary",
            TransportKind::Shared => "shared",
        }
    }
}

/// Why the dispatcher discarded an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    RateLimited,
    ValidationFailed,
    CapabilityNotFound,
    QueueFull,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::RateLimited => "rate_limited",
            DropReason::ValidationFailed => "validation_failed",
            DropReason::CapabilityNotFound => "capability_not_found",
            DropReason::QueueFull => "queue_full",
        }
    }
}

/// Dispatcher observability sink.
pub trait DispatcherMetrics: Send + Sync {
    fn inc_messages_received(&self, transport: TransportKind);

    fn inc_messages_dropped(&self, reason: DropReason);

    /// Queue occupancy for a receiver, 0.0 empty to 1.0 full.
    fn set_receive_queue_usage(&self, capability_id: &str, don_id: DonId, usage: f64);
}

// =============================================================================
// TIME
// =============================================================================

/// Time source abstraction for testability.
pub trait TimeSource: Send + Sync {
    /// Returns the current timestamp in milliseconds.
    fn now(&self) -> Timestamp;
}

/// Default system time source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }
}

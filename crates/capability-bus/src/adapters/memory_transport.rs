//! # In-Memory Transport
//!
//! A process-local peer network for tests and single-process clusters.
//! Every joined peer gets a bounded inbound channel; `send` looks up the
//! destination and waits for room in its channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shared_types::PeerId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::ports::outbound::{InboundMessage, PeerTransport, TransportError};

/// Default inbound channel capacity per peer.
pub const DEFAULT_PEER_CHANNEL_CAPACITY: usize = 1024;

/// Shared routing table of an in-memory cluster.
#[derive(Clone)]
pub struct InMemoryNetwork {
    peers: Arc<RwLock<HashMap<PeerId, mpsc::Sender<InboundMessage>>>>,
    capacity: usize,
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PEER_CHANNEL_CAPACITY)
    }
}

impl InMemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Attach a peer. Joining again with the same ID replaces its channel.
    pub fn join(&self, id: PeerId) -> Arc<InMemoryTransport> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.peers.write().insert(id, tx);
        debug!(peer_id = %id, "peer joined in-memory network");
        Arc::new(InMemoryTransport {
            id,
            network: self.clone(),
            inbound: Mutex::new(Some(rx)),
            messages_sent: AtomicU64::new(0),
        })
    }

    /// Detach a peer; its inbound stream ends once drained.
    pub fn leave(&self, id: &PeerId) {
        self.peers.write().remove(id);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}

/// One peer's handle on an [`InMemoryNetwork`].
pub struct InMemoryTransport {
    id: PeerId,
    network: InMemoryNetwork,
    inbound: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    messages_sent: AtomicU64,
}

impl InMemoryTransport {
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PeerTransport for InMemoryTransport {
    fn id(&self) -> PeerId {
        self.id
    }

    async fn send(&self, peer: PeerId, payload: Vec<u8>) -> Result<(), TransportError> {
        let route = self.network.peers.read().get(&peer).cloned();
        let Some(route) = route else {
            return Err(TransportError::PeerUnreachable(peer));
        };
        route
            .send(InboundMessage {
                sender: self.id,
                payload,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound.lock().take()
    }
}

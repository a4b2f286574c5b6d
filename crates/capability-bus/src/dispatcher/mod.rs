//! # Dispatcher
//!
//! Routes signed capability messages between this node and its peers.
//!
//! ## Inbound Pipeline
//!
//! ```text
//! transport ─► rate limit ─► validate ─► lookup (capability, DON, method)
//!                  │             │               │
//!                drop      error reply     error reply      ─► try_send to key queue
//!                                                                 (drop when full)
//! ```
//!
//! Each receiver key owns a bounded queue drained by one task, so messages
//! for the same key are handled in arrival order and a slow receiver never
//! blocks the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use shared_types::{
    sanitize_log_string, DonId, ErrorCode, Message, MessageBody, PeerId, RateLimiter,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::adapters::NoopMetrics;
use crate::schedule;
use crate::config::DispatcherConfig;
use crate::errors::DispatcherError;
use crate::ports::inbound::{Dispatcher, Receiver};
use crate::ports::outbound::{
    DispatcherMetrics, DropReason, InboundMessage, PeerTransport, Signer, SystemTimeSource,
    TimeSource, TransportKind,
};
use crate::validation::validate_message;

#[cfg(test)]
mod tests;

/// Routing key for inbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiverKey {
    pub capability_id: String,
    pub don_id: DonId,
    /// Empty for whole-capability receivers.
    pub method: String,
}

impl ReceiverKey {
    pub fn new(capability_id: &str, don_id: DonId, method: &str) -> Self {
        Self {
            capability_id: capability_id.to_string(),
            don_id,
            method: method.to_string(),
        }
    }

    fn of(body: &MessageBody) -> Self {
        Self::new(
            &body.capability_id,
            body.capability_don_id,
            &body.capability_method,
        )
    }
}

struct ReceiverEntry {
    queue: mpsc::Sender<MessageBody>,
    cancel: CancellationToken,
}

/// Peer-to-peer message dispatcher.
///
/// Construct with [`DispatcherService::new`], attach at least one transport,
/// then call [`DispatcherService::start`] from inside a Tokio runtime.
pub struct DispatcherService {
    config: DispatcherConfig,
    primary: Option<Arc<dyn PeerTransport>>,
    shared: Option<Arc<dyn PeerTransport>>,
    signer: Arc<dyn Signer>,
    metrics: Arc<dyn DispatcherMetrics>,
    time_source: Arc<dyn TimeSource>,
    rate_limiter: RateLimiter<PeerId>,
    receivers: RwLock<HashMap<ReceiverKey, ReceiverEntry>>,
    local_peer: RwLock<Option<PeerId>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl DispatcherService {
    pub fn new(config: DispatcherConfig, signer: Arc<dyn Signer>) -> Result<Self, DispatcherError> {
        config.validate()?;
        let rate_limiter = RateLimiter::new(config.rate_limit.clone())
            .map_err(|e| DispatcherError::Config(e.into()))?;
        Ok(Self {
            config,
            primary: None,
            shared: None,
            signer,
            metrics: Arc::new(NoopMetrics),
            time_source: Arc::new(SystemTimeSource),
            rate_limiter,
            receivers: RwLock::new(HashMap::new()),
            local_peer: RwLock::new(None),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn with_primary_transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.primary = Some(transport);
        self
    }

    /// Transport shared with other subsystems of the node.
    pub fn with_shared_transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.shared = Some(transport);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn DispatcherMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Local identity, known once started.
    pub fn local_peer(&self) -> Option<PeerId> {
        *self.local_peer.read()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.read().len()
    }

    /// Senders currently holding a rate limiter entry.
    pub fn rate_limited_senders(&self) -> usize {
        self.rate_limiter.tracked_senders()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Resolve the local identity, initialize the signer and spawn the
    /// receive loop.
    pub fn start(self: &Arc<Self>) -> Result<(), DispatcherError> {
        let local = match (&self.primary, &self.shared) {
            (None, None) => return Err(DispatcherError::NoTransport),
            (Some(primary), Some(shared)) if primary.id() != shared.id() => {
                return Err(DispatcherError::PeerIdMismatch {
                    primary: primary.id().to_string(),
                    shared: shared.id().to_string(),
                });
            }
            (Some(primary), _) => primary.id(),
            (None, Some(shared)) => shared.id(),
        };

        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DispatcherError::AlreadyStarted);
        }
        if let Err(err) = self.signer.initialize() {
            self.started.store(false, Ordering::SeqCst);
            return Err(DispatcherError::SignerInit(err));
        }
        *self.local_peer.write() = Some(local);

        let primary_rx = self.primary.as_ref().and_then(|t| t.take_inbound());
        let shared_rx = self.shared.as_ref().and_then(|t| t.take_inbound());
        let this = Arc::clone(self);
        self.tasks
            .spawn(async move { this.receive_loop(primary_rx, shared_rx).await });

        info!(peer_id = %local, "dispatcher started");
        Ok(())
    }

    /// Stop the receive loop and every receiver task, then wait for them.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.receivers.write().clear();
        self.tasks.close();
        self.tasks.wait().await;
        info!("dispatcher closed");
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    async fn receive_loop(
        self: Arc<Self>,
        mut primary: Option<mpsc::Receiver<InboundMessage>>,
        mut shared: Option<mpsc::Receiver<InboundMessage>>,
    ) {
        let mut cleanup = schedule::ticker(self.config.rate_limit_cleanup_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("dispatcher stopped, exiting receive loop");
                    return;
                }
                _ = cleanup.tick() => {
                    let removed = self.rate_limiter.cleanup(self.config.sender_idle_timeout);
                    if removed > 0 {
                        debug!(removed, "dropped idle sender rate limits");
                    }
                }
                msg = recv_from(&mut primary), if primary.is_some() => match msg {
                    Some(msg) => {
                        self.metrics.inc_messages_received(TransportKind::Primary);
                        self.handle_message(msg).await;
                    }
                    None => {
                        warn!("primary transport channel closed");
                        primary = None;
                    }
                },
                msg = recv_from(&mut shared), if shared.is_some() => match msg {
                    Some(msg) => {
                        self.metrics.inc_messages_received(TransportKind::Shared);
                        self.handle_message(msg).await;
                    }
                    None => {
                        info!("shared peer channel closed, exiting receive loop");
                        return;
                    }
                },
            }
        }
    }

    pub(crate) async fn handle_message(&self, msg: InboundMessage) {
        if !self.rate_limiter.allow(&msg.sender) {
            error!(sender = %msg.sender, "rate limit exceeded, dropping message");
            self.metrics.inc_messages_dropped(DropReason::RateLimited);
            return;
        }

        let Some(local) = self.local_peer() else {
            return;
        };

        let body = match validate_message(&msg, &local, self.config.supported_version) {
            Ok(body) => body,
            Err(invalid) => {
                debug!(sender = %msg.sender, error = %invalid.error, "received invalid message");
                self.metrics.inc_messages_dropped(DropReason::ValidationFailed);
                self.try_respond_with_error(
                    msg.sender,
                    invalid.body.map(|b| *b),
                    ErrorCode::ValidationFailed,
                )
                .await;
                return;
            }
        };

        let key = ReceiverKey::of(&body);
        let queue = self.receivers.read().get(&key).map(|r| r.queue.clone());
        let Some(queue) = queue else {
            debug!(
                capability_id = %sanitize_log_string(&key.capability_id),
                don_id = key.don_id,
                method = %sanitize_log_string(&key.method),
                "received message for unregistered capability",
            );
            self.metrics
                .inc_messages_dropped(DropReason::CapabilityNotFound);
            self.try_respond_with_error(msg.sender, Some(body), ErrorCode::CapabilityNotFound)
                .await;
            return;
        };

        let buffer = self.config.receiver_buffer_size;
        let used = buffer.saturating_sub(queue.capacity());
        self.metrics
            .set_receive_queue_usage(&key.capability_id, key.don_id, used as f64 / buffer as f64);

        match queue.try_send(body) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    capability_id = %sanitize_log_string(&key.capability_id),
                    don_id = key.don_id,
                    method = %sanitize_log_string(&key.method),
                    "receive channel full, dropping message",
                );
                self.metrics.inc_messages_dropped(DropReason::QueueFull);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    capability_id = %sanitize_log_string(&key.capability_id),
                    "receiver removed, dropping message"
                );
            }
        }
    }

    /// Reply to `peer` with `code`, unless the body is unknown or is itself
    /// an error response.
    async fn try_respond_with_error(
        &self,
        peer: PeerId,
        body: Option<MessageBody>,
        code: ErrorCode,
    ) {
        let Some(mut body) = body else {
            return;
        };
        if body.has_error() {
            debug!(sender = %peer, "not answering an error response with another error");
            return;
        }
        body.error = code;
        body.payload = Vec::new();
        if let Err(err) = self.send(peer, body).await {
            debug!(peer = %peer, error = %err, "failed to send error response");
        }
    }

    fn spawn_receiver(&self, receiver: Arc<dyn Receiver>) -> ReceiverEntry {
        let (queue, mut rx) = mpsc::channel(self.config.receiver_buffer_size);
        let cancel = self.shutdown.child_token();
        let task_cancel = cancel.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => return,
                    body = rx.recv() => match body {
                        Some(body) => receiver.receive(body).await,
                        None => return,
                    },
                }
            }
        });
        ReceiverEntry { queue, cancel }
    }
}

async fn recv_from(rx: &mut Option<mpsc::Receiver<InboundMessage>>) -> Option<InboundMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Dispatcher for DispatcherService {
    async fn send(&self, peer: PeerId, mut body: MessageBody) -> Result<(), DispatcherError> {
        let local = self.local_peer().ok_or(DispatcherError::NotStarted)?;
        body.version = self.config.supported_version;
        body.sender = local;
        body.receiver = peer;
        body.timestamp = self.time_source.now();

        let raw_body = body.encode()?;
        let signature = self
            .signer
            .sign(&raw_body)
            .map_err(DispatcherError::Signing)?;
        let raw = Message {
            signature,
            body: raw_body,
        }
        .encode()?;

        let transport = if self.config.send_to_shared_peer {
            self.shared.as_ref()
        } else {
            self.primary.as_ref()
        };
        match transport {
            Some(transport) => Ok(transport.send(peer, raw).await?),
            None => Err(DispatcherError::NoPeerAvailable),
        }
    }

    fn set_receiver_for_method(
        &self,
        capability_id: &str,
        don_id: DonId,
        method: &str,
        receiver: Arc<dyn Receiver>,
    ) -> Result<(), DispatcherError> {
        let key = ReceiverKey::new(capability_id, don_id, method);
        let mut receivers = self.receivers.write();
        if receivers.contains_key(&key) {
            return Err(DispatcherError::ReceiverExists {
                capability_id: key.capability_id,
                don_id,
                method: key.method,
            });
        }
        let entry = self.spawn_receiver(receiver);
        receivers.insert(key, entry);
        debug!(
            capability_id = %sanitize_log_string(capability_id),
            don_id,
            method = %sanitize_log_string(method),
            "receiver set"
        );
        Ok(())
    }

    fn remove_receiver_for_method(&self, capability_id: &str, don_id: DonId, method: &str) {
        let key = ReceiverKey::new(capability_id, don_id, method);
        if let Some(entry) = self.receivers.write().remove(&key) {
            entry.cancel.cancel();
            debug!(
                capability_id = %sanitize_log_string(capability_id),
                don_id,
                method = %sanitize_log_string(method),
                "receiver removed"
            );
        }
    }
}

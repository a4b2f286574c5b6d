//! Test doubles and fixtures.
//!
//! Available to this crate's unit tests and, behind the `test-utils`
//! feature, to downstream integration tests.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_crypto::Ed25519KeyPair;
use shared_types::{
    CapabilityInfo, CapabilityRequest, CapabilityResponse, CapabilityType, Don, DonId, Message,
    MessageBody, PeerId, RequestMetadata, TriggerEvent, TriggerRegistrationRequest,
    TriggerResponse, Value,
};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::ReceiverKey;
use crate::errors::{CapabilityError, DispatcherError};
use crate::ports::inbound::{Dispatcher, ExecutableCapability, Receiver, TriggerCapability};
use crate::ports::outbound::{InboundMessage, TimeSource, Timestamp};
use crate::PROTOCOL_VERSION;

pub const WORKFLOW_ID_1: &str = "15c631d295ef5e32deb99a10ee6804bc4af13855687559d7ff6552ac6dbb2ce0";
pub const WORKFLOW_ID_2: &str = "c0cb5f8e2ac62b2dd03d6ad2be8c1d3cf4a0a7cd5a20ee3b1c54b2dd5e4b4f13";
pub const CAPABILITY_ID: &str = "cap_id@1";
pub const CAPABILITY_DON_ID: DonId = 1;
pub const WORKFLOW_DON_ID: DonId = 2;
pub const EXECUTION_ID_1: &str =
    "95ef5e32deb99a10ee6804bc4af13855687559d7ff6552ac6dbb2ce0abbadeed";
pub const EXECUTION_ID_2: &str =
    "85ef5e32deb99a10ee6804bc4af13855687559d7ff6552ac6dbb2ce0abbadeee";

// =============================================================================
// TIME
// =============================================================================

/// Manually advanced clock.
pub struct MockTimeSource {
    time: AtomicI64,
}

impl MockTimeSource {
    pub fn new(initial: Timestamp) -> Self {
        Self {
            time: AtomicI64::new(initial),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.time
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, time: Timestamp) {
        self.time.store(time, Ordering::SeqCst);
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Timestamp {
        self.time.load(Ordering::SeqCst)
    }
}

// =============================================================================
// IDENTITIES
// =============================================================================

pub fn keypair(seed: u8) -> Ed25519KeyPair {
    Ed25519KeyPair::from_seed([seed; 32])
}

pub fn peer_of(keypair: &Ed25519KeyPair) -> PeerId {
    PeerId::new(*keypair.public_key().as_bytes())
}

/// A DON whose members have known keys.
pub struct TestDon {
    pub don: Don,
    pub keys: Vec<Ed25519KeyPair>,
}

impl TestDon {
    /// `size` members with seeds `first_seed..first_seed + size`.
    pub fn new(id: DonId, size: u8, f: u8, first_seed: u8) -> Self {
        let keys: Vec<Ed25519KeyPair> = (0..size).map(|i| keypair(first_seed + i)).collect();
        let members = keys.iter().map(peer_of).collect();
        Self {
            don: Don::new(id, members, f),
            keys,
        }
    }

    pub fn member(&self, index: usize) -> PeerId {
        self.don.members[index]
    }
}

pub fn trigger_capability_info() -> CapabilityInfo {
    CapabilityInfo::new(CAPABILITY_ID, CapabilityType::Trigger)
        .with_description("Remote Trigger")
}

pub fn executable_capability_info() -> CapabilityInfo {
    CapabilityInfo::new(CAPABILITY_ID, CapabilityType::Target)
        .with_description("Remote Target")
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Sign `body` as `keypair`, addressed to `receiver`, as a transport would
/// deliver it.
pub fn signed_message(
    keypair: &Ed25519KeyPair,
    receiver: PeerId,
    mut body: MessageBody,
) -> InboundMessage {
    let sender = peer_of(keypair);
    body.version = PROTOCOL_VERSION;
    body.sender = sender;
    body.receiver = receiver;
    let raw = body.encode().unwrap();
    let payload = Message {
        signature: keypair.sign(&raw).to_vec(),
        body: raw,
    }
    .encode()
    .unwrap();
    InboundMessage { sender, payload }
}

pub fn trigger_response(event_id: &str, event: &str) -> TriggerResponse {
    TriggerResponse::from_event(TriggerEvent {
        trigger_type: "testTrigger".into(),
        id: event_id.into(),
        outputs: Value::map([("event", Value::from(event))]),
    })
}

pub fn registration_request(workflow_id: &str) -> TriggerRegistrationRequest {
    let mut request = TriggerRegistrationRequest {
        trigger_id: format!("trigger-{}", &workflow_id[..workflow_id.len().min(8)]),
        ..Default::default()
    };
    request.metadata.workflow_id = workflow_id.to_string();
    request.metadata.workflow_don_id = WORKFLOW_DON_ID;
    request
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

/// Records every send instead of putting it on a transport.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<(PeerId, MessageBody)>>,
    receivers: Mutex<HashMap<ReceiverKey, Arc<dyn Receiver>>>,
    notify: Notify,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(PeerId, MessageBody)> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn take_sent(&self) -> Vec<(PeerId, MessageBody)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn has_receiver(&self, capability_id: &str, don_id: DonId, method: &str) -> bool {
        self.receivers
            .lock()
            .contains_key(&ReceiverKey::new(capability_id, don_id, method))
    }

    /// Wait until at least `count` messages were sent.
    pub async fn wait_for_sends(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.sent_count() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn send(&self, peer: PeerId, body: MessageBody) -> Result<(), DispatcherError> {
        self.sent.lock().push((peer, body));
        self.notify.notify_waiters();
        Ok(())
    }

    fn set_receiver_for_method(
        &self,
        capability_id: &str,
        don_id: DonId,
        method: &str,
        receiver: Arc<dyn Receiver>,
    ) -> Result<(), DispatcherError> {
        let key = ReceiverKey::new(capability_id, don_id, method);
        let mut receivers = self.receivers.lock();
        if receivers.contains_key(&key) {
            return Err(DispatcherError::ReceiverExists {
                capability_id: key.capability_id,
                don_id,
                method: key.method,
            });
        }
        receivers.insert(key, receiver);
        Ok(())
    }

    fn remove_receiver_for_method(&self, capability_id: &str, don_id: DonId, method: &str) {
        self.receivers
            .lock()
            .remove(&ReceiverKey::new(capability_id, don_id, method));
    }
}

/// Forwards every received body into an unbounded channel.
pub struct ChannelReceiver {
    tx: mpsc::UnboundedSender<MessageBody>,
}

impl ChannelReceiver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MessageBody>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Receiver for ChannelReceiver {
    async fn receive(&self, body: MessageBody) {
        let _ = self.tx.send(body);
    }
}

// =============================================================================
// TRIGGER
// =============================================================================

/// A local trigger whose events are pushed by the test.
pub struct FakeTrigger {
    info: CapabilityInfo,
    streams: Mutex<HashMap<String, mpsc::Sender<TriggerResponse>>>,
    registered: Mutex<Vec<TriggerRegistrationRequest>>,
    unregistered: Mutex<Vec<TriggerRegistrationRequest>>,
    fail_registrations: AtomicBool,
}

impl FakeTrigger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            info: trigger_capability_info(),
            streams: Mutex::new(HashMap::new()),
            registered: Mutex::new(Vec::new()),
            unregistered: Mutex::new(Vec::new()),
            fail_registrations: AtomicBool::new(false),
        })
    }

    pub fn fail_registrations(&self, fail: bool) {
        self.fail_registrations.store(fail, Ordering::SeqCst);
    }

    pub fn registered(&self) -> Vec<TriggerRegistrationRequest> {
        self.registered.lock().clone()
    }

    pub fn register_count(&self) -> usize {
        self.registered.lock().len()
    }

    pub fn unregister_count(&self) -> usize {
        self.unregistered.lock().len()
    }

    /// Push `response` to every registered workflow. Returns how many
    /// streams accepted it.
    pub fn emit(&self, response: &TriggerResponse) -> usize {
        self.streams
            .lock()
            .values()
            .filter(|tx| tx.try_send(response.clone()).is_ok())
            .count()
    }
}

#[async_trait]
impl TriggerCapability for FakeTrigger {
    async fn info(&self) -> Result<CapabilityInfo, CapabilityError> {
        Ok(self.info.clone())
    }

    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TriggerResponse>, CapabilityError> {
        if self.fail_registrations.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("registration rejected").into());
        }
        let (tx, rx) = mpsc::channel(100);
        self.streams
            .lock()
            .insert(request.metadata.workflow_id.clone(), tx);
        self.registered.lock().push(request);
        Ok(rx)
    }

    async fn unregister_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<(), CapabilityError> {
        self.streams.lock().remove(&request.metadata.workflow_id);
        self.unregistered.lock().push(request);
        Ok(())
    }
}

// =============================================================================
// EXECUTABLE
// =============================================================================

pub fn capability_request(execution_id: &str, inputs: Value) -> CapabilityRequest {
    CapabilityRequest {
        method: String::new(),
        metadata: RequestMetadata {
            workflow_id: WORKFLOW_ID_1.into(),
            workflow_don_id: WORKFLOW_DON_ID,
            workflow_execution_id: execution_id.into(),
            reference_id: "step1".into(),
            ..Default::default()
        },
        inputs,
        config: None,
    }
}

/// A local executable that echoes its inputs. `Null` inputs fail.
pub struct FakeExecutable {
    info: CapabilityInfo,
    calls: Mutex<Vec<CapabilityRequest>>,
}

impl FakeExecutable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            info: executable_capability_info(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<CapabilityRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ExecutableCapability for FakeExecutable {
    async fn info(&self) -> Result<CapabilityInfo, CapabilityError> {
        Ok(self.info.clone())
    }

    async fn execute(
        &self,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        self.calls.lock().push(request.clone());
        if request.inputs == Value::Null {
            return Err(anyhow::anyhow!("execution failed").into());
        }
        Ok(CapabilityResponse {
            value: request.inputs,
        })
    }
}

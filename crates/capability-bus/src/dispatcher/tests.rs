use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use capability_telemetry::CapabilityMetrics;
use shared_crypto::CryptoError;
use proptest::prelude::*;
use shared_crypto::Ed25519KeyPair;
use shared_types::{ErrorCode, Message, MessageBody, Method, PeerId, RateLimiterConfig};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::adapters::{Ed25519Signer, InMemoryNetwork, InMemoryTransport};
use crate::test_utils::{keypair, peer_of, signed_message, wait_until, ChannelReceiver};
use crate::validation::validate_message;

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    dispatcher: Arc<DispatcherService>,
    local_id: PeerId,
    remote_key: Ed25519KeyPair,
    remote_id: PeerId,
    remote_transport: Arc<InMemoryTransport>,
    remote_inbox: mpsc::Receiver<InboundMessage>,
    metrics: CapabilityMetrics,
}

fn unlimited() -> RateLimiterConfig {
    RateLimiterConfig {
        global_rps: 10_000.0,
        global_burst: 10_000,
        per_sender_rps: 10_000.0,
        per_sender_burst: 10_000,
    }
}

fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        rate_limit: unlimited(),
        ..Default::default()
    }
}

fn harness(config: DispatcherConfig) -> Harness {
    let network = InMemoryNetwork::new();
    let local_key = keypair(1);
    let local_id = peer_of(&local_key);
    let local_transport = network.join(local_id);

    let remote_key = keypair(2);
    let remote_id = peer_of(&remote_key);
    let remote_transport = network.join(remote_id);
    let remote_inbox = remote_transport.take_inbound().unwrap();

    let metrics = CapabilityMetrics::new("test").unwrap();
    let dispatcher = Arc::new(
        DispatcherService::new(config, Arc::new(Ed25519Signer::new(local_key)))
            .unwrap()
            .with_primary_transport(local_transport)
            .with_metrics(Arc::new(metrics.clone())),
    );
    dispatcher.start().unwrap();

    Harness {
        dispatcher,
        local_id,
        remote_key,
        remote_id,
        remote_transport,
        remote_inbox,
        metrics,
    }
}

fn body(capability_id: &str, method: &str, payload: &[u8]) -> MessageBody {
    MessageBody::new(capability_id, 1, method, 2, Method::TriggerEvent, payload.to_vec())
}

fn decode_reply(msg: &InboundMessage) -> MessageBody {
    MessageBody::decode(&Message::decode(&msg.payload).unwrap().body).unwrap()
}

impl Harness {
    fn from_remote(&self, body: MessageBody) -> InboundMessage {
        signed_message(&self.remote_key, self.local_id, body)
    }
}

// =============================================================================
// ROUTING
// =============================================================================

#[tokio::test]
async fn test_message_routed_through_transport() {
    let h = harness(test_config());
    let (receiver, mut rx) = ChannelReceiver::new();
    h.dispatcher.set_receiver("cap1", 1, receiver).unwrap();

    let msg = h.from_remote(body("cap1", "", b"payload1"));
    h.remote_transport
        .send(h.local_id, msg.payload)
        .await
        .unwrap();

    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.payload, b"payload1".to_vec());
    assert_eq!(received.sender, h.remote_id);
    assert_eq!(h.metrics.messages_received("primary"), 1);
}

#[tokio::test]
async fn test_routing_by_method() {
    let h = harness(test_config());
    let (receiver_a, mut rx_a) = ChannelReceiver::new();
    let (receiver_b, mut rx_b) = ChannelReceiver::new();
    h.dispatcher
        .set_receiver_for_method("cap1", 1, "A", receiver_a)
        .unwrap();
    h.dispatcher
        .set_receiver_for_method("cap1", 1, "B", receiver_b)
        .unwrap();

    h.dispatcher
        .handle_message(h.from_remote(body("cap1", "B", b"to-b")))
        .await;
    h.dispatcher
        .handle_message(h.from_remote(body("cap1", "A", b"to-a")))
        .await;

    assert_eq!(timeout(WAIT, rx_a.recv()).await.unwrap().unwrap().payload, b"to-a".to_vec());
    assert_eq!(timeout(WAIT, rx_b.recv()).await.unwrap().unwrap().payload, b"to-b".to_vec());
}

#[tokio::test]
async fn test_duplicate_receiver_rejected() {
    let h = harness(test_config());
    let (receiver, _rx) = ChannelReceiver::new();
    h.dispatcher.set_receiver("cap1", 1, receiver.clone()).unwrap();
    let err = h
        .dispatcher
        .set_receiver("cap1", 1, receiver.clone())
        .unwrap_err();
    assert!(matches!(err, DispatcherError::ReceiverExists { .. }));

    // Same capability on another DON or method is a different key.
    h.dispatcher.set_receiver("cap1", 2, receiver.clone()).unwrap();
    h.dispatcher
        .set_receiver_for_method("cap1", 1, "Method", receiver.clone())
        .unwrap();

    h.dispatcher.remove_receiver("cap1", 1);
    h.dispatcher.set_receiver("cap1", 1, receiver).unwrap();
    assert_eq!(h.dispatcher.receiver_count(), 3);
}

// =============================================================================
// ERROR REPLIES
// =============================================================================

#[tokio::test]
async fn test_unknown_capability_answered_with_not_found() {
    let mut h = harness(test_config());
    h.dispatcher
        .handle_message(h.from_remote(body("cap2", "", b"payload")))
        .await;

    let reply = timeout(WAIT, h.remote_inbox.recv()).await.unwrap().unwrap();
    assert_eq!(reply.sender, h.local_id);
    let reply = decode_reply(&reply);
    assert_eq!(reply.error, ErrorCode::CapabilityNotFound);
    assert!(reply.payload.is_empty());
    assert_eq!(reply.capability_id, "cap2");
    assert_eq!(reply.sender, h.local_id);
    assert_eq!(reply.receiver, h.remote_id);
    assert_eq!(h.metrics.messages_dropped("capability_not_found"), 1);
}

#[tokio::test]
async fn test_error_response_never_answered() {
    let mut h = harness(test_config());
    let mut incoming = body("cap2", "", b"");
    incoming.error = ErrorCode::CapabilityNotFound;
    h.dispatcher.handle_message(h.from_remote(incoming)).await;

    assert!(h.remote_inbox.try_recv().is_err());
}

#[tokio::test]
async fn test_bad_signature_answered_with_validation_failed() {
    let mut h = harness(test_config());
    let mut forged = body("cap1", "", b"payload");
    forged.version = 1;
    forged.sender = h.remote_id;
    forged.receiver = h.local_id;
    let raw = forged.encode().unwrap();
    let payload = Message {
        signature: keypair(99).sign(&raw).to_vec(),
        body: raw,
    }
    .encode()
    .unwrap();

    h.dispatcher
        .handle_message(InboundMessage {
            sender: h.remote_id,
            payload,
        })
        .await;

    let reply = timeout(WAIT, h.remote_inbox.recv()).await.unwrap().unwrap();
    assert_eq!(decode_reply(&reply).error, ErrorCode::ValidationFailed);
    assert_eq!(h.metrics.messages_dropped("validation_failed"), 1);
}

#[tokio::test]
async fn test_undecodable_message_dropped_silently() {
    let mut h = harness(test_config());
    h.dispatcher
        .handle_message(InboundMessage {
            sender: h.remote_id,
            payload: vec![0xFF; 16],
        })
        .await;
    assert!(h.remote_inbox.try_recv().is_err());
    assert_eq!(h.metrics.messages_dropped("validation_failed"), 1);
}

// =============================================================================
// BACKPRESSURE
// =============================================================================

#[tokio::test]
async fn test_rate_limited_sender_dropped() {
    let config = DispatcherConfig {
        rate_limit: RateLimiterConfig {
            per_sender_rps: 0.001,
            per_sender_burst: 2,
            ..unlimited()
        },
        ..Default::default()
    };
    let h = harness(config);
    let (receiver, mut rx) = ChannelReceiver::new();
    h.dispatcher.set_receiver("cap1", 1, receiver).unwrap();

    for i in 0..3u8 {
        h.dispatcher
            .handle_message(h.from_remote(body("cap1", "", &[i])))
            .await;
    }

    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap().payload, vec![0]);
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap().payload, vec![1]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(h.metrics.messages_dropped("rate_limited"), 1);
}

#[tokio::test]
async fn test_idle_sender_limits_swept() {
    let config = DispatcherConfig {
        rate_limit: RateLimiterConfig {
            per_sender_rps: 0.001,
            per_sender_burst: 1,
            ..unlimited()
        },
        rate_limit_cleanup_interval: Duration::from_millis(20),
        sender_idle_timeout: Duration::ZERO,
        ..Default::default()
    };
    let h = harness(config);
    let (receiver, mut rx) = ChannelReceiver::new();
    h.dispatcher.set_receiver("cap1", 1, receiver).unwrap();

    for seed in 10..60u8 {
        let key = keypair(seed);
        let msg = signed_message(&key, h.local_id, body("cap1", "", &[seed]));
        h.dispatcher.handle_message(msg).await;
    }
    h.dispatcher
        .handle_message(h.from_remote(body("cap1", "", &[0])))
        .await;
    assert_eq!(h.dispatcher.rate_limited_senders(), 51);

    assert!(wait_until(WAIT, || h.dispatcher.rate_limited_senders() == 0).await);

    // The swept sender's exhausted budget went with its entry.
    h.dispatcher
        .handle_message(h.from_remote(body("cap1", "", &[1])))
        .await;
    let mut payloads = Vec::new();
    while let Ok(Some(received)) = timeout(Duration::from_millis(200), rx.recv()).await {
        if received.sender == h.remote_id {
            payloads.push(received.payload);
        }
    }
    assert_eq!(payloads, vec![vec![0], vec![1]]);
}

#[tokio::test]
async fn test_full_queue_drops_and_reports_usage() {
    let config = DispatcherConfig {
        receiver_buffer_size: 1,
        ..test_config()
    };
    let h = harness(config);
    let (receiver, _rx) = ChannelReceiver::new();
    h.dispatcher.set_receiver("cap1", 1, receiver).unwrap();

    // The single-threaded test runtime does not run the consumer task until
    // this test yields, so the queue fills up.
    for i in 0..3u8 {
        h.dispatcher
            .handle_message(h.from_remote(body("cap1", "", &[i])))
            .await;
    }

    assert_eq!(h.metrics.messages_dropped("queue_full"), 2);
    assert!((h.metrics.receive_channel_usage("cap1", 1) - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_removed_receiver_discards_queue() {
    let h = harness(test_config());
    let (receiver, mut rx) = ChannelReceiver::new();
    h.dispatcher.set_receiver("cap1", 1, receiver).unwrap();

    h.dispatcher
        .handle_message(h.from_remote(body("cap1", "", b"queued")))
        .await;
    h.dispatcher.remove_receiver("cap1", 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

// =============================================================================
// SEND
// =============================================================================

#[tokio::test]
async fn test_send_stamps_and_signs() {
    let mut h = harness(test_config());
    let outgoing = body("cap1", "", b"hello");
    h.dispatcher.send(h.remote_id, outgoing).await.unwrap();

    let raw = timeout(WAIT, h.remote_inbox.recv()).await.unwrap().unwrap();
    let verified = validate_message(&raw, &h.remote_id, 1).unwrap();
    assert_eq!(verified.sender, h.local_id);
    assert_eq!(verified.receiver, h.remote_id);
    assert_eq!(verified.version, 1);
    assert!(verified.timestamp > 0);
    assert_eq!(verified.payload, b"hello".to_vec());
}

#[tokio::test]
async fn test_send_before_start_fails() {
    let network = InMemoryNetwork::new();
    let dispatcher = DispatcherService::new(test_config(), Arc::new(Ed25519Signer::new(keypair(1))))
        .unwrap()
        .with_primary_transport(network.join(peer_of(&keypair(1))));
    let result = dispatcher.send(PeerId::new([2; 32]), body("cap1", "", b"")).await;
    assert!(matches!(result, Err(DispatcherError::NotStarted)));
}

#[tokio::test]
async fn test_send_via_shared_peer() {
    let local_key = keypair(1);
    let local_id = peer_of(&local_key);
    let primary_net = InMemoryNetwork::new();
    let shared_net = InMemoryNetwork::new();
    let remote = shared_net.join(PeerId::new([2; 32]));
    let mut remote_inbox = remote.take_inbound().unwrap();

    let config = DispatcherConfig {
        send_to_shared_peer: true,
        ..test_config()
    };
    let dispatcher = Arc::new(
        DispatcherService::new(config, Arc::new(Ed25519Signer::new(local_key.clone())))
            .unwrap()
            .with_primary_transport(primary_net.join(local_id))
            .with_shared_transport(shared_net.join(local_id)),
    );
    dispatcher.start().unwrap();
    dispatcher
        .send(remote.id(), body("cap1", "", b""))
        .await
        .unwrap();
    assert!(timeout(WAIT, remote_inbox.recv()).await.unwrap().is_some());

    // Primary-only routing cannot reach a peer that is only on the shared network.
    let primary_only = Arc::new(
        DispatcherService::new(test_config(), Arc::new(Ed25519Signer::new(local_key)))
            .unwrap()
            .with_primary_transport(primary_net.join(local_id))
            .with_shared_transport(shared_net.join(local_id)),
    );
    primary_only.start().unwrap();
    let result = primary_only.send(remote.id(), body("cap1", "", b"")).await;
    assert!(matches!(result, Err(DispatcherError::Transport(_))));
}

#[tokio::test]
async fn test_no_peer_for_selected_route() {
    let local_key = keypair(1);
    let network = InMemoryNetwork::new();
    let config = DispatcherConfig {
        send_to_shared_peer: true,
        ..test_config()
    };
    let dispatcher = Arc::new(
        DispatcherService::new(config, Arc::new(Ed25519Signer::new(local_key.clone())))
            .unwrap()
            .with_primary_transport(network.join(peer_of(&local_key))),
    );
    dispatcher.start().unwrap();
    let result = dispatcher.send(PeerId::new([2; 32]), body("cap1", "", b"")).await;
    assert!(matches!(result, Err(DispatcherError::NoPeerAvailable)));
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test]
async fn test_start_validation() {
    let signer = || Arc::new(Ed25519Signer::new(keypair(1)));

    let bare = Arc::new(DispatcherService::new(test_config(), signer()).unwrap());
    assert!(matches!(bare.start(), Err(DispatcherError::NoTransport)));

    let network = InMemoryNetwork::new();
    let mismatched = Arc::new(
        DispatcherService::new(test_config(), signer())
            .unwrap()
            .with_primary_transport(network.join(PeerId::new([1; 32])))
            .with_shared_transport(network.join(PeerId::new([2; 32]))),
    );
    assert!(matches!(
        mismatched.start(),
        Err(DispatcherError::PeerIdMismatch { .. })
    ));

    let shared_only = Arc::new(
        DispatcherService::new(test_config(), signer())
            .unwrap()
            .with_shared_transport(network.join(PeerId::new([3; 32]))),
    );
    shared_only.start().unwrap();
    assert_eq!(shared_only.local_peer(), Some(PeerId::new([3; 32])));
    assert!(matches!(
        shared_only.start(),
        Err(DispatcherError::AlreadyStarted)
    ));
    shared_only.close().await;
}

/// Signer that counts initializations and can be made to fail.
struct CountingSigner {
    inner: Ed25519Signer,
    initializations: AtomicUsize,
    fail: bool,
}

impl CountingSigner {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: Ed25519Signer::new(keypair(1)),
            initializations: AtomicUsize::new(0),
            fail,
        })
    }
}

impl Signer for CountingSigner {
    fn initialize(&self) -> Result<(), CryptoError> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CryptoError::KeyNotInitialized);
        }
        self.inner.initialize()
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner.sign(data)
    }
}

#[tokio::test]
async fn test_second_start_does_not_reinitialize_signer() {
    let network = InMemoryNetwork::new();
    let signer = CountingSigner::new(false);
    let dispatcher = Arc::new(
        DispatcherService::new(test_config(), signer.clone())
            .unwrap()
            .with_primary_transport(network.join(PeerId::new([4; 32]))),
    );
    dispatcher.start().unwrap();
    assert!(matches!(
        dispatcher.start(),
        Err(DispatcherError::AlreadyStarted)
    ));
    assert_eq!(signer.initializations.load(Ordering::SeqCst), 1);
    dispatcher.close().await;
}

#[tokio::test]
async fn test_failed_signer_init_allows_retry() {
    let network = InMemoryNetwork::new();
    let signer = CountingSigner::new(true);
    let dispatcher = Arc::new(
        DispatcherService::new(test_config(), signer.clone())
            .unwrap()
            .with_primary_transport(network.join(PeerId::new([5; 32]))),
    );
    assert!(matches!(
        dispatcher.start(),
        Err(DispatcherError::SignerInit(_))
    ));
    assert_eq!(dispatcher.local_peer(), None);
    // Not marked started, so the next attempt reaches the signer again.
    assert!(matches!(
        dispatcher.start(),
        Err(DispatcherError::SignerInit(_))
    ));
    assert_eq!(signer.initializations.load(Ordering::SeqCst), 2);
}

#[test]
fn test_invalid_config_rejected() {
    let config = DispatcherConfig {
        receiver_buffer_size: 0,
        ..Default::default()
    };
    let result = DispatcherService::new(config, Arc::new(Ed25519Signer::new(keypair(1))));
    assert!(matches!(result, Err(DispatcherError::Config(_))));
}

#[tokio::test]
async fn test_close_stops_receivers() {
    let h = harness(test_config());
    let (receiver, mut rx) = ChannelReceiver::new();
    h.dispatcher.set_receiver("cap1", 1, receiver).unwrap();
    h.dispatcher.close().await;

    assert_eq!(h.dispatcher.receiver_count(), 0);
    // The receiver was dropped with its task, so the channel is closed.
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), None);
}

// =============================================================================
// ORDERING
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_per_key_fifo(keys in prop::collection::vec(any::<bool>(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (got_a, got_b) = runtime.block_on(async {
            let h = harness(test_config());
            let (receiver_a, mut rx_a) = ChannelReceiver::new();
            let (receiver_b, mut rx_b) = ChannelReceiver::new();
            h.dispatcher.set_receiver("capA", 1, receiver_a).unwrap();
            h.dispatcher.set_receiver("capB", 1, receiver_b).unwrap();

            for (i, to_a) in keys.iter().enumerate() {
                let capability = if *to_a { "capA" } else { "capB" };
                let seq = (i as u32).to_be_bytes();
                h.dispatcher
                    .handle_message(h.from_remote(body(capability, "", &seq)))
                    .await;
            }

            let expected_a = keys.iter().filter(|k| **k).count();
            let expected_b = keys.len() - expected_a;
            let mut got_a = Vec::new();
            let mut got_b = Vec::new();
            for _ in 0..expected_a {
                got_a.push(timeout(WAIT, rx_a.recv()).await.unwrap().unwrap().payload);
            }
            for _ in 0..expected_b {
                got_b.push(timeout(WAIT, rx_b.recv()).await.unwrap().unwrap().payload);
            }
            (got_a, got_b)
        });

        let mut sorted_a = got_a.clone();
        sorted_a.sort();
        let mut sorted_b = got_b.clone();
        sorted_b.sort();
        prop_assert_eq!(got_a, sorted_a);
        prop_assert_eq!(got_b, sorted_b);
    }
}

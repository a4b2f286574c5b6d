//! # Dispatch Between Nodes
//!
//! Routing by (capability, DON, method) and the error replies a node sends
//! back when it cannot route a message.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use capability_bus::test_utils::{keypair, peer_of, signed_message, ChannelReceiver};
    use capability_bus::{Dispatcher, InMemoryNetwork, PeerTransport};
    use shared_types::{ErrorCode, Message, MessageBody, Method};
    use tokio::time::timeout;

    use crate::integration::spawn_node;

    const WAIT: Duration = Duration::from_secs(2);

    fn body(capability_id: &str, payload: &[u8]) -> MessageBody {
        MessageBody::new(capability_id, 1, "", 2, Method::TriggerEvent, payload.to_vec())
    }

    #[tokio::test]
    async fn test_message_routed_between_nodes() {
        let network = InMemoryNetwork::new();
        let a = spawn_node(&network, keypair(1));
        let b = spawn_node(&network, keypair(2));
        let (receiver, mut rx) = ChannelReceiver::new();
        b.dispatcher.set_receiver("cap1", 1, receiver).unwrap();

        a.dispatcher.send(b.id, body("cap1", b"payload1")).await.unwrap();

        let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.payload, b"payload1".to_vec());
        assert_eq!(received.sender, a.id);
        assert_eq!(received.receiver, b.id);
        assert_eq!(b.metrics.messages_received("primary"), 1);

        a.dispatcher.close().await;
        b.dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_unknown_capability_round_trip() {
        let network = InMemoryNetwork::new();
        let a = spawn_node(&network, keypair(1));
        let b = spawn_node(&network, keypair(2));
        let (receiver, mut rx) = ChannelReceiver::new();
        a.dispatcher.set_receiver("cap1", 1, receiver).unwrap();

        // B has no receiver for cap1 and answers with an error that A routes
        // back to its own cap1 receiver.
        a.dispatcher.send(b.id, body("cap1", b"payload")).await.unwrap();

        let reply = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(reply.error, ErrorCode::CapabilityNotFound);
        assert_eq!(reply.sender, b.id);
        assert!(reply.payload.is_empty());
        assert_eq!(b.metrics.messages_dropped("capability_not_found"), 1);

        // A never answers the error, so B receives nothing further.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.metrics.messages_received("primary"), 1);
    }

    #[tokio::test]
    async fn test_misaddressed_message_rejected() {
        let network = InMemoryNetwork::new();
        let b = spawn_node(&network, keypair(2));
        let (receiver, mut rx) = ChannelReceiver::new();
        b.dispatcher.set_receiver("cap1", 1, receiver).unwrap();

        let raw_key = keypair(9);
        let raw = network.join(peer_of(&raw_key));
        let mut raw_inbox = raw.take_inbound().unwrap();

        // Signed for a third peer but delivered to B.
        let elsewhere = peer_of(&keypair(3));
        let msg = signed_message(&raw_key, elsewhere, body("cap1", b"payload"));
        raw.send(b.id, msg.payload).await.unwrap();

        let reply = timeout(WAIT, raw_inbox.recv()).await.unwrap().unwrap();
        let reply = MessageBody::decode(&Message::decode(&reply.payload).unwrap().body).unwrap();
        assert_eq!(reply.error, ErrorCode::ValidationFailed);
        assert_eq!(reply.receiver, raw.id());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(b.metrics.messages_dropped("validation_failed"), 1);
    }
}

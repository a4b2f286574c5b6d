//! Inbound envelope validation.
//!
//! Checks run in order: envelope decode, body decode, signature against the
//! body's sender key, sender against the transport sender, protocol version,
//! receiver against the local peer. Once the body decodes, failures carry it
//! so the dispatcher can answer with an error response.

use shared_crypto::Ed25519PublicKey;
use shared_types::{Message, MessageBody, MessageError, PeerId};
use thiserror::Error;

use crate::ports::outbound::InboundMessage;

/// A rejected inbound message.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct InvalidMessage {
    #[source]
    pub error: MessageError,
    /// The decoded body, when decoding got that far.
    pub body: Option<Box<MessageBody>>,
}

impl InvalidMessage {
    fn undecodable(error: MessageError) -> Self {
        Self { error, body: None }
    }

    fn with_body(error: MessageError, body: MessageBody) -> Self {
        Self {
            error,
            body: Some(Box::new(body)),
        }
    }
}

/// Validate a raw inbound message addressed to `local`.
pub fn validate_message(
    msg: &InboundMessage,
    local: &PeerId,
    supported_version: u32,
) -> Result<MessageBody, InvalidMessage> {
    let envelope = Message::decode(&msg.payload)
        .map_err(|e| InvalidMessage::undecodable(MessageError::Malformed(e)))?;
    let body = MessageBody::decode(&envelope.body)
        .map_err(|e| InvalidMessage::undecodable(MessageError::Malformed(e)))?;

    let verified = Ed25519PublicKey::from_bytes(body.sender.0)
        .and_then(|key| key.verify_slice(&envelope.body, &envelope.signature));
    if verified.is_err() {
        return Err(InvalidMessage::with_body(MessageError::InvalidSignature, body));
    }

    if body.sender != msg.sender {
        let error = MessageError::SenderMismatch {
            claimed: body.sender.to_string(),
            actual: msg.sender.to_string(),
        };
        return Err(InvalidMessage::with_body(error, body));
    }

    if body.version != supported_version {
        let error = MessageError::UnsupportedVersion {
            received: body.version,
            supported: supported_version,
        };
        return Err(InvalidMessage::with_body(error, body));
    }

    if body.receiver != *local {
        let error = MessageError::ReceiverMismatch {
            receiver: body.receiver.to_string(),
            local: local.to_string(),
        };
        return Err(InvalidMessage::with_body(error, body));
    }

    Ok(body)
}

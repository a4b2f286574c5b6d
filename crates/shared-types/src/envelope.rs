//! # Wire Envelope
//!
//! The signed envelope placed on the peer transport.
//!
//! ```text
//! Message { signature, body: bytes }
//!                            │
//!                            └── MessageBody { version, sender, receiver, ... }
//! ```
//!
//! ## Security Properties
//!
//! - **Signature over raw bytes**: the signature covers the encoded body
//!   exactly as transmitted; verifiers check it before decoding the body.
//! - **Versioning**: every outbound body is stamped with a protocol version.
//! - **Sender authority**: the body's `sender` is the Ed25519 key that must
//!   verify the signature.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

use crate::entities::{DonId, PeerId};
use crate::errors::CodecError;

/// Upper bound on any decoded wire structure.
pub const MAX_WIRE_SIZE: u64 = 8 * 1024 * 1024;

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_WIRE_SIZE)
}

pub(crate) fn to_wire<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>, CodecError> {
    wire_options()
        .serialize(value)
        .map_err(|e| CodecError::encode(what, e))
}

pub(crate) fn from_wire<T: DeserializeOwned>(
    what: &'static str,
    bytes: &[u8],
) -> Result<T, CodecError> {
    wire_options()
        .deserialize(bytes)
        .map_err(|e| CodecError::decode(what, e))
}

/// Capability-level operation carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    RegisterTrigger,
    /// Kept for wire numbering. Publishers ignore it; a registration lapses
    /// once its refreshes stop.
    UnregisterTrigger,
    TriggerEvent,
    /// Request to an executable capability, and each member's response.
    Execute,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::RegisterTrigger => "RegisterTrigger",
            Method::UnregisterTrigger => "UnregisterTrigger",
            Method::TriggerEvent => "TriggerEvent",
            Method::Execute => "Execute",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported back to a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ErrorCode {
    #[default]
    Ok,
    ValidationFailed,
    CapabilityNotFound,
    InvalidRequest,
    Internal,
    /// The server dropped the request before it could be executed.
    Timeout,
}

/// Routing data for a (possibly batched) trigger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TriggerEventMetadata {
    pub workflow_ids: Vec<String>,
    pub trigger_event_id: String,
}

/// The signed envelope.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Ed25519 signature over `body`.
    #[serde_as(as = "Bytes")]
    pub signature: Vec<u8>,
    /// Encoded [`MessageBody`].
    #[serde_as(as = "Bytes")]
    pub body: Vec<u8>,
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        to_wire("message", self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        from_wire("message", bytes)
    }
}

/// Body of a capability message.
///
/// Constructed by publishers/subscribers with the routing fields set; the
/// dispatcher stamps `version`, `sender`, `receiver` and `timestamp` at send
/// time.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    // =========================================================================
    // HEADER (stamped by the dispatcher)
    // =========================================================================
    pub version: u32,
    pub sender: PeerId,
    pub receiver: PeerId,
    /// Unix milliseconds.
    pub timestamp: i64,

    // =========================================================================
    // ROUTING
    // =========================================================================
    pub capability_id: String,
    pub capability_don_id: DonId,
    /// Empty for legacy whole-capability receivers.
    pub capability_method: String,
    pub caller_don_id: DonId,
    pub method: Method,

    // =========================================================================
    // PAYLOAD
    // =========================================================================
    #[serde_as(as = "Bytes")]
    pub payload: Vec<u8>,
    pub error: ErrorCode,
    pub error_msg: String,
    pub metadata: Option<TriggerEventMetadata>,
    /// Correlates executable requests with their responses. Empty for
    /// trigger traffic.
    pub message_id: String,
}

impl MessageBody {
    /// A body with routing fields set and an empty header.
    pub fn new(
        capability_id: impl Into<String>,
        capability_don_id: DonId,
        capability_method: impl Into<String>,
        caller_don_id: DonId,
        method: Method,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: 0,
            sender: PeerId::default(),
            receiver: PeerId::default(),
            timestamp: 0,
            capability_id: capability_id.into(),
            capability_don_id,
            capability_method: capability_method.into(),
            caller_don_id,
            method,
            payload,
            error: ErrorCode::Ok,
            error_msg: String::new(),
            metadata: None,
            message_id: String::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: TriggerEventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        to_wire("message body", self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        from_wire("message body", bytes)
    }

    pub fn has_error(&self) -> bool {
        self.error != ErrorCode::Ok
    }
}

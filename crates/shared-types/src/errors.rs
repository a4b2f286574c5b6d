//! # Error Types
//!
//! Errors shared by the wire codec, message validation and input checks.

use thiserror::Error;

/// Wire encoding/decoding failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },

    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
}

impl CodecError {
    pub(crate) fn encode(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Encode {
            what,
            reason: err.to_string(),
        }
    }

    pub(crate) fn decode(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            what,
            reason: err.to_string(),
        }
    }
}

/// Errors related to inbound message verification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageError {
    /// Envelope or body could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(#[from] CodecError),

    /// Message version not supported.
    #[error("unsupported version: received {received}, supported {supported}")]
    UnsupportedVersion { received: u32, supported: u32 },

    /// Signature does not verify against the body's sender key.
    #[error("invalid signature")]
    InvalidSignature,

    /// Body sender differs from the transport-level sender.
    #[error("sender mismatch: body claims {claimed}, transport reports {actual}")]
    SenderMismatch { claimed: String, actual: String },

    /// Message addressed to a different node.
    #[error("receiver mismatch: message addressed to {receiver}, local peer is {local}")]
    ReceiverMismatch { receiver: String, local: String },
}

/// Rejected user-supplied input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("empty workflowID")]
    EmptyWorkflowId,

    #[error("workflow ID must be {expected} characters long, got {actual}")]
    WorkflowIdLength { expected: usize, actual: usize },

    #[error("workflow ID must be hex encoded")]
    WorkflowIdNotHex,

    #[error("invalid peer ID: expected 64 hex characters")]
    InvalidPeerId,

    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),

    #[error("empty workflow execution ID")]
    EmptyExecutionId,

    #[error("invalid message id")]
    InvalidMessageId,
}

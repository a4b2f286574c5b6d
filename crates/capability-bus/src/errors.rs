//! Error types for the capability bus.

use shared_crypto::CryptoError;
use shared_types::{CodecError, DonId, ErrorCode, InputError};
use thiserror::Error;

use crate::ports::outbound::TransportError;

/// Dispatcher errors.
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// A receiver is already registered for this key.
    #[error("receiver already exists for capability {capability_id}, donID {don_id}, method {method:?}")]
    ReceiverExists {
        capability_id: String,
        don_id: DonId,
        method: String,
    },

    /// Neither a primary nor a shared transport was configured.
    #[error("either a primary or a shared transport must be set")]
    NoTransport,

    /// Primary and shared transports report different local identities.
    #[error("peer ID from primary transport ({primary}) and shared transport ({shared}) do not match")]
    PeerIdMismatch { primary: String, shared: String },

    #[error("dispatcher already started")]
    AlreadyStarted,

    /// Send attempted before `start`.
    #[error("dispatcher not started")]
    NotStarted,

    /// No transport can carry the outbound message.
    #[error("no peer available to send message")]
    NoPeerAvailable,

    #[error("failed to initialize signer: {0}")]
    SignerInit(#[source] CryptoError),

    #[error("failed to sign message: {0}")]
    Signing(#[source] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration and lifecycle errors for publishers and subscribers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("config not set - call set_config() before start()")]
    NotSet,

    #[error("capability info provided does not match the subscriber's capabilityID: {provided} != {expected}")]
    CapabilityMismatch { provided: String, expected: String },

    #[error("localDONID=0 provided")]
    ZeroLocalDon,

    #[error("empty remoteDON provided")]
    EmptyRemoteDon,

    #[error("empty capDonInfo provided")]
    EmptyCapabilityDon,

    #[error("empty localDonInfo provided")]
    EmptyLocalDon,

    #[error("empty workflowDONs provided")]
    EmptyWorkflowDons,

    #[error("aggregator not set")]
    MissingAggregator,

    #[error("receiver buffer size must be positive")]
    ZeroReceiverBuffer,

    #[error("rate limit cleanup interval must be positive")]
    ZeroCleanupInterval,

    #[error("{0} already started")]
    AlreadyStarted(&'static str),

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error(transparent)]
    RateLimit(#[from] InputError),
}

/// Errors surfaced through the capability ports.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// No sub-capability registered for the requested method.
    #[error("method {0} not defined")]
    MethodNotDefined(String),

    #[error("{0} is not supported by remote capabilities")]
    Unsupported(&'static str),

    /// No response quorum before the request timeout.
    #[error("request expired before a response quorum was reached")]
    RequestExpired,

    /// A request with the same message ID is still in flight.
    #[error("request {0} already in flight")]
    DuplicateRequest(String),

    /// The client shut down while the request was waiting.
    #[error("client closed before a response quorum was reached")]
    Closed,

    /// A quorum of remote members answered with the same error.
    #[error("remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error(transparent)]
    InvalidInput(#[from] InputError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Failure inside an underlying capability implementation.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Aggregation failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AggregationError {
    #[error("not enough identical responses found: need {required}, best candidate has {found}")]
    NotEnoughIdentical { required: usize, found: usize },

    #[error(transparent)]
    Decode(#[from] CodecError),
}

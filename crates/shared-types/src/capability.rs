//! # Capability Request/Response Types
//!
//! Types passed between a workflow engine and a capability implementation,
//! local or remote. Trigger registrations and responses are carried as the
//! payload of a [`crate::MessageBody`], so their encoding must be
//! deterministic: byte-identical payloads are what aggregation compares.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::{from_wire, to_wire};
use crate::errors::CodecError;

// =============================================================================
// VALUES
// =============================================================================

/// A deterministic value tree for trigger outputs and capability configs.
///
/// Maps are ordered so two nodes encoding the same logical value produce
/// the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Build a map value from `(key, value)` pairs.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Map(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

// =============================================================================
// TRIGGERS
// =============================================================================

/// Workflow context attached to every capability request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RequestMetadata {
    pub workflow_id: String,
    pub workflow_owner: String,
    pub workflow_name: String,
    pub workflow_don_id: u32,
    /// One run of the workflow. Required for executable requests.
    pub workflow_execution_id: String,
    /// The workflow step issuing the request.
    pub reference_id: String,
}

/// A workflow's request to receive events from a trigger capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TriggerRegistrationRequest {
    pub trigger_id: String,
    /// Capability method the registration targets. Empty for legacy callers.
    pub method: String,
    pub metadata: RequestMetadata,
    pub config: Option<Value>,
}

impl TriggerRegistrationRequest {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        to_wire("trigger registration request", self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        from_wire("trigger registration request", bytes)
    }
}

/// A single event produced by a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TriggerEvent {
    pub trigger_type: String,
    /// Unique per event; used as the aggregation key on the subscriber side.
    pub id: String,
    pub outputs: Value,
}

/// What a trigger delivers to a registered workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TriggerResponse {
    pub event: TriggerEvent,
    pub error: Option<String>,
}

impl TriggerResponse {
    pub fn from_event(event: TriggerEvent) -> Self {
        Self { event, error: None }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        to_wire("trigger response", self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        from_wire("trigger response", bytes)
    }
}

// =============================================================================
// EXECUTABLES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CapabilityRequest {
    pub method: String,
    pub metadata: RequestMetadata,
    pub inputs: Value,
    pub config: Option<Value>,
}

impl CapabilityRequest {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        to_wire("capability request", self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        from_wire("capability request", bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CapabilityResponse {
    pub value: Value,
}

impl CapabilityResponse {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        to_wire("capability response", self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        from_wire("capability response", bytes)
    }
}

// =============================================================================
// REMOTE EXECUTABLE CONFIG
// =============================================================================

/// Tuning for remote executable clients and servers.
///
/// Zero values are replaced by defaults in
/// [`RemoteExecutableConfig::apply_defaults`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteExecutableConfig {
    /// How long a client waits for a response quorum, and how long a server
    /// keeps a request before expiring it.
    pub request_timeout: Duration,
    /// Requests a server executes concurrently. Read once at start.
    pub server_max_parallel_requests: u32,
}

impl RemoteExecutableConfig {
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
    pub const DEFAULT_SERVER_MAX_PARALLEL_REQUESTS: u32 = 10;

    pub fn apply_defaults(&mut self) {
        if self.request_timeout.is_zero() {
            self.request_timeout = Self::DEFAULT_REQUEST_TIMEOUT;
        }
        if self.server_max_parallel_requests == 0 {
            self.server_max_parallel_requests = Self::DEFAULT_SERVER_MAX_PARALLEL_REQUESTS;
        }
    }

    pub fn or_default(config: Option<Self>) -> Self {
        let mut config = config.unwrap_or_default();
        config.apply_defaults();
        config
    }
}

// =============================================================================
// REMOTE TRIGGER CONFIG
// =============================================================================

/// Tuning for remote trigger publishers and subscribers.
///
/// Zero values are replaced by defaults in [`RemoteTriggerConfig::apply_defaults`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteTriggerConfig {
    /// How often subscribers re-announce their registrations.
    pub registration_refresh: Duration,
    /// How long a publisher keeps a registration without refreshes.
    pub registration_expiry: Duration,
    /// Distinct responses a subscriber needs before aggregating an event.
    pub min_responses_to_aggregate: u32,
    /// Freshness window for trigger events; also the cleanup period.
    pub message_expiry: Duration,
    /// Maximum workflow IDs per batched trigger event message.
    pub max_batch_size: u32,
    /// How long a publisher collects identical events before sending.
    pub batch_collection_period: Duration,
}

impl RemoteTriggerConfig {
    pub const DEFAULT_REGISTRATION_REFRESH: Duration = Duration::from_secs(30);
    pub const DEFAULT_REGISTRATION_EXPIRY: Duration = Duration::from_secs(120);
    pub const DEFAULT_MIN_RESPONSES_TO_AGGREGATE: u32 = 1;
    pub const DEFAULT_MESSAGE_EXPIRY: Duration = Duration::from_secs(120);
    pub const DEFAULT_MAX_BATCH_SIZE: u32 = 100;
    pub const DEFAULT_BATCH_COLLECTION_PERIOD: Duration = Duration::from_millis(100);

    /// Replace every zero field with its default.
    pub fn apply_defaults(&mut self) {
        if self.registration_refresh.is_zero() {
            self.registration_refresh = Self::DEFAULT_REGISTRATION_REFRESH;
        }
        if self.registration_expiry.is_zero() {
            self.registration_expiry = Self::DEFAULT_REGISTRATION_EXPIRY;
        }
        if self.min_responses_to_aggregate == 0 {
            self.min_responses_to_aggregate = Self::DEFAULT_MIN_RESPONSES_TO_AGGREGATE;
        }
        if self.message_expiry.is_zero() {
            self.message_expiry = Self::DEFAULT_MESSAGE_EXPIRY;
        }
        if self.max_batch_size == 0 {
            self.max_batch_size = Self::DEFAULT_MAX_BATCH_SIZE;
        }
        if self.batch_collection_period.is_zero() {
            self.batch_collection_period = Self::DEFAULT_BATCH_COLLECTION_PERIOD;
        }
    }

    /// Defaults applied to an optional config.
    pub fn or_default(config: Option<Self>) -> Self {
        let mut config = config.unwrap_or_default();
        config.apply_defaults();
        config
    }
}

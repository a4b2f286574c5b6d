//! # Capability Bus
//!
//! Lets a node expose and consume capabilities (remote triggers and
//! executable actions) across a peer-to-peer cluster organized into DONs.
//!
//! ## Message Flow
//!
//! ```text
//!  PeerTransport ──► DispatcherService::receive_loop
//!                      │  rate limit ─► validate ─► route by (capability, DON, method)
//!                      ▼
//!                   per-key bounded queue ──► one consumer task per key
//!                      │
//!           ┌──────────┴───────────┬────────────────────────┐
//!           ▼                      ▼                        ▼
//!   TriggerPublisher        TriggerSubscriber        ExecutableServer
//!   (2F+1 registrations,    (min responses,          (F+1 requesters,
//!    fan out events)         aggregate, deliver)      execute once, reply)
//!           │                      │                        │
//!           └────► Dispatcher::send (stamp, sign, encode) ──► PeerTransport
//! ```
//!
//! ## Delivery Semantics
//!
//! - **At most once**: full queues and rate-limited senders drop messages;
//!   registrations and events are refreshed or resent by their producers.
//! - **Per-key FIFO**: each receiver key is drained by exactly one task.
//! - **Byzantine quorum**: registrations need `2F+1` senders with `F+1`
//!   identical payloads before the underlying trigger is touched.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod adapters;
pub mod combined_client;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod executable;
pub mod ports;
pub mod trigger_publisher;
pub mod trigger_subscriber;
pub mod validation;

mod schedule;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export main types
pub use adapters::{Ed25519Signer, InMemoryNetwork, InMemoryTransport, NoopMetrics};
pub use combined_client::CombinedClient;
pub use config::DispatcherConfig;
pub use dispatcher::{DispatcherService, ReceiverKey};
pub use domain::{aggregate_mode_raw, Aggregator, MessageCache, ModeAggregator};
pub use errors::{AggregationError, CapabilityError, ConfigError, DispatcherError};
pub use executable::{ExecutableClient, ExecutableServer};
pub use ports::inbound::{Dispatcher, ExecutableCapability, Receiver, TriggerCapability};
pub use ports::outbound::{
    DispatcherMetrics, DropReason, InboundMessage, PeerTransport, Signer, SystemTimeSource,
    TimeSource, TransportError, TransportKind,
};
pub use trigger_publisher::TriggerPublisher;
pub use trigger_subscriber::TriggerSubscriber;
pub use validation::{validate_message, InvalidMessage};

/// Wire protocol version stamped on outbound messages.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default per-key receive queue capacity.
pub const DEFAULT_RECEIVER_BUFFER_SIZE: usize = 10_000;

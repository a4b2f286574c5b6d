//! # Shared Types Crate
//!
//! Domain entities, capability request/response types and the signed wire
//! envelope used by the capability bus.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: every type that crosses a crate boundary or
//!   the wire is defined here.
//! - **Envelope Integrity**: a [`Message`] carries the signature over the raw
//!   [`MessageBody`] bytes; the body is never re-encoded before verification.
//! - **Append-Only Wire Format**: fields are only ever added at the end of the
//!   wire structs, never renumbered or reordered.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod capability;
pub mod entities;
pub mod envelope;
pub mod errors;
pub mod rate_limiter;
pub mod security;

pub use capability::*;
pub use entities::*;
pub use envelope::{ErrorCode, Message, MessageBody, Method, TriggerEventMetadata};
pub use errors::*;
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use security::{sanitize_log_string, validate_message_id, validate_workflow_id};

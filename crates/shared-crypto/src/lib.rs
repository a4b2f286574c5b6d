//! # Shared Crypto
//!
//! Node identity keys for the capability bus.
//!
//! | Module | Algorithm | Use Case |
//! |--------|-----------|----------|
//! | `signatures` | Ed25519 | Signing outbound message bodies, verifying inbound ones |
//!
//! A node's peer ID is its Ed25519 public key, so verification needs nothing
//! beyond the sender field of the message being checked.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod errors;
pub mod signatures;

// Re-exports
pub use errors::CryptoError;
pub use signatures::{Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! # Core Domain Entities
//!
//! - **Networking**: [`PeerId`]
//! - **Topology**: [`Don`], [`DonId`]
//! - **Capabilities**: [`CapabilityInfo`], [`CapabilityType`]

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::InputError;

/// Identifier of a DON.
pub type DonId = u32;

/// Unique identifier of a node in the peer network.
///
/// The bytes are the node's Ed25519 public key, so a message's sender field
/// can be used directly to verify its signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Length of a peer identifier in bytes.
    pub const LEN: usize = 32;

    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a peer ID from its 64-character hex form.
    pub fn from_hex(s: &str) -> Result<Self, InputError> {
        let bytes = hex::decode(s).map_err(|_| InputError::InvalidPeerId)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| InputError::InvalidPeerId)?;
        Ok(Self(bytes))
    }

    /// The all-zero identifier, used as "unset".
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &hex::encode(&self.0[..8]))
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// A decentralized operator network: a group of nodes sharing an identity
/// and a fault-tolerance parameter `f`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Don {
    pub id: DonId,
    pub members: Vec<PeerId>,
    /// Maximum number of simultaneously faulty members tolerated.
    pub f: u8,
}

impl Don {
    pub fn new(id: DonId, members: Vec<PeerId>, f: u8) -> Self {
        Self { id, members, f }
    }

    /// `2F+1`: responses needed for an honest majority.
    pub fn honest_majority(&self) -> usize {
        2 * usize::from(self.f) + 1
    }

    /// `F+1`: agreeing responses needed to include at least one honest node.
    pub fn honest_agreement(&self) -> usize {
        usize::from(self.f) + 1
    }

    pub fn member_set(&self) -> HashSet<PeerId> {
        self.members.iter().copied().collect()
    }

    pub fn is_member(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }
}

/// Kind of capability exposed by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityType {
    Trigger,
    Action,
    Consensus,
    Target,
}

/// Static description of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    /// Capability identifier, e.g. `cap_id@1`.
    pub id: String,
    pub capability_type: CapabilityType,
    pub description: String,
}

impl CapabilityInfo {
    pub fn new(id: impl Into<String>, capability_type: CapabilityType) -> Self {
        Self {
            id: id.into(),
            capability_type,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

//! Ed25519 signer backed by the node's peer key.

use std::sync::atomic::{AtomicBool, Ordering};

use shared_crypto::{CryptoError, Ed25519KeyPair};
use shared_types::PeerId;

use crate::ports::outbound::Signer;

/// Signs with an in-memory Ed25519 key. Refuses to sign until initialized.
pub struct Ed25519Signer {
    keypair: Ed25519KeyPair,
    initialized: AtomicBool,
}

impl Ed25519Signer {
    pub fn new(keypair: Ed25519KeyPair) -> Self {
        Self {
            keypair,
            initialized: AtomicBool::new(false),
        }
    }

    /// The peer ID matching this key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(*self.keypair.public_key().as_bytes())
    }
}

impl Signer for Ed25519Signer {
    fn initialize(&self) -> Result<(), CryptoError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(CryptoError::KeyNotInitialized);
        }
        Ok(self.keypair.sign(data).to_vec())
    }
}

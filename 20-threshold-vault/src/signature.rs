//! Message signing and validation.
//!
//! The protocol only needs two operations from its signature scheme: sign a
//! byte payload with our own key, and check a payload against the public key
//! of a named peer. [`SignatureService`] captures exactly that so messages
//! never depend on a concrete scheme; [`Ed25519Signatures`] is the
//! implementation every replica and client uses.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::config::PeerId;

/// Detached signature bytes, base64 on the wire.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(#[serde(with = "crate::encoding::base64_bytes")] Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Mutable access for tests that need to corrupt a signature.
    pub fn as_bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", crate::encoding::encode(&self.0))
    }
}

pub trait SignatureService: Send + Sync {
    /// Peer id whose key produces our signatures.
    fn id(&self) -> PeerId;

    fn sign(&self, data: &[u8]) -> Signature;

    /// Returns `false` for bad signatures and for senders we hold no key for.
    fn validate(&self, data: &[u8], sender: PeerId, signature: &Signature) -> bool;
}

/// Directory of every peer's verifying key, shared by all services of a process.
pub type KeyDirectory = HashMap<PeerId, VerifyingKey>;

/// Ed25519 signer for one peer plus the public keys of the whole topology.
pub struct Ed25519Signatures {
    id: PeerId,
    signing_key: SigningKey,
    directory: Arc<KeyDirectory>,
}

impl Ed25519Signatures {
    pub fn new(id: PeerId, signing_key: SigningKey, directory: Arc<KeyDirectory>) -> Self {
        Self {
            id,
            signing_key,
            directory,
        }
    }
}

impl SignatureService for Ed25519Signatures {
    fn id(&self) -> PeerId {
        self.id
    }

    fn sign(&self, data: &[u8]) -> Signature {
        Signature(self.signing_key.sign(data).to_bytes().to_vec())
    }

    fn validate(&self, data: &[u8], sender: PeerId, signature: &Signature) -> bool {
        let Some(key) = self.directory.get(&sender) else {
            return false;
        };
        let Ok(signature) = ed25519_dalek::Signature::from_slice(signature.as_bytes()) else {
            return false;
        };
        key.verify(data, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn services() -> (Ed25519Signatures, Ed25519Signatures) {
        let mut rng = StdRng::seed_from_u64(11);
        let alice = SigningKey::generate(&mut rng);
        let bob = SigningKey::generate(&mut rng);
        let mut directory = KeyDirectory::new();
        directory.insert(1, alice.verifying_key());
        directory.insert(2, bob.verifying_key());
        let directory = Arc::new(directory);
        (
            Ed25519Signatures::new(1, alice, Arc::clone(&directory)),
            Ed25519Signatures::new(2, bob, directory),
        )
    }

    #[test]
    fn peers_validate_each_others_signatures() {
        let (alice, bob) = services();
        let signature = alice.sign(b"payload");
        assert!(bob.validate(b"payload", 1, &signature));
        assert!(!bob.validate(b"payload", 2, &signature), "wrong signer");
        assert!(!bob.validate(b"other", 1, &signature), "wrong payload");
    }

    #[test]
    fn unknown_sender_and_garbage_are_rejected_without_panicking() {
        let (alice, bob) = services();
        let signature = alice.sign(b"payload");
        assert!(!bob.validate(b"payload", 99, &signature));
        assert!(!bob.validate(b"payload", 1, &Signature::from_bytes(vec![1, 2, 3])));
    }
}

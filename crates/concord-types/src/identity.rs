//! Peer identity keys using Ed25519 signatures.
//!
//! Identity signatures authenticate who produced a message. They are
//! unrelated to the threshold key shares used to sign results.

use crate::error::{Result, TypesError};
use crate::NAMESPACE;
use ed25519_consensus::{Signature, SigningKey, VerificationKey};
use serde::{Deserialize, Serialize};

/// Serializable identity public key (hex-encoded Ed25519 verification key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(pub String);

impl IdentityKey {
    /// Creates from an Ed25519 verification key.
    pub fn from_verification_key(vk: &VerificationKey) -> Self {
        Self(hex::encode(vk.to_bytes()))
    }

    /// Converts to an Ed25519 verification key.
    pub fn to_verification_key(&self) -> Result<VerificationKey> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&self.0, &mut bytes)?;
        VerificationKey::try_from(bytes).map_err(|e| TypesError::InvalidKey(e.to_string()))
    }

    /// Verifies `signature` over `message` in the Concord namespace.
    ///
    /// Malformed keys or signatures verify as `false`.
    pub fn verify(&self, message: &[u8], signature: &IdentitySignature) -> bool {
        let Ok(vk) = self.to_verification_key() else {
            return false;
        };
        let Ok(sig) = signature.to_signature() else {
            return false;
        };
        vk.verify(&sig, &namespaced(message)).is_ok()
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serializable identity signature (hex-encoded Ed25519 signature).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySignature(pub String);

impl IdentitySignature {
    /// Converts to an Ed25519 signature.
    pub fn to_signature(&self) -> Result<Signature> {
        let mut bytes = [0u8; 64];
        hex::decode_to_slice(&self.0, &mut bytes)?;
        Ok(Signature::from(bytes))
    }
}

/// The signing half of a peer identity.
pub struct PeerIdentity {
    key: SigningKey,
}

impl PeerIdentity {
    /// Creates an identity from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from(seed),
        }
    }

    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::new(rand::thread_rng()),
        }
    }

    /// Derives a deterministic identity for devnets and tests.
    pub fn for_devnet(index: u16) -> Self {
        let mut seed = [0u8; 32];
        seed[..2].copy_from_slice(&index.to_be_bytes());
        seed[2..10].copy_from_slice(b"devnet-0");
        Self::from_seed(seed)
    }

    /// Returns the public identity key.
    pub fn public_key(&self) -> IdentityKey {
        IdentityKey::from_verification_key(&self.key.verification_key())
    }

    /// Signs `message` in the Concord namespace.
    pub fn sign(&self, message: &[u8]) -> IdentitySignature {
        let sig = self.key.sign(&namespaced(message));
        IdentitySignature(hex::encode(sig.to_bytes()))
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("public_key", &self.public_key())
            .finish()
    }
}

fn namespaced(message: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(NAMESPACE.len() + message.len());
    data.extend_from_slice(NAMESPACE);
    data.extend_from_slice(message);
    data
}

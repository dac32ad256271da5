//! Opaque threshold signature material.
//!
//! The key-share capability owns the actual scheme; the consensus engine only
//! moves these bytes around.

use crate::id::Digest;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A partial signature produced by one committee member's key share.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureShare(Vec<u8>);

impl SignatureShare {
    /// Wraps raw share bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SignatureShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.len().min(8);
        write!(f, "SignatureShare({})", hex::encode(&self.0[..shown]))
    }
}

/// A full signature recovered from a quorum of shares.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThresholdSignature(Vec<u8>);

impl ThresholdSignature {
    /// Wraps raw signature bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Digest of the signature bytes; used as round entropy.
    pub fn digest(&self) -> Digest {
        Digest::hash(&self.0)
    }
}

impl fmt::Debug for ThresholdSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.len().min(8);
        write!(f, "ThresholdSignature({})", hex::encode(&self.0[..shown]))
    }
}

impl fmt::Display for ThresholdSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

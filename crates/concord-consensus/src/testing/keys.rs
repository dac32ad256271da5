//! Hash-based stand-in for a threshold key share.

use crate::collaborators::KeyShare;
use crate::error::{ConsensusError, Result};
use concord_types::{quorum, Digest, PeerIndex, SignatureShare, ThresholdSignature};
use std::collections::BTreeSet;

/// Threshold signatures simulated with hashes.
///
/// A share is `H("share:" || group || peer || message)` and the full
/// signature is `H("full:" || group || message)`, so every member of the same
/// group can verify anyone's share and the full signature is unique per
/// message. A faulty instance signs garbage.
#[derive(Debug, Clone)]
pub struct MockKeyShare {
    group: Vec<u8>,
    size: u16,
    own: PeerIndex,
    threshold: usize,
    faulty: bool,
}

impl MockKeyShare {
    /// Creates the share of `own` in a group of `size` members.
    pub fn new(group: &[u8], size: u16, own: PeerIndex) -> Self {
        Self {
            group: group.to_vec(),
            size,
            own,
            threshold: quorum::quorum(usize::from(size)),
            faulty: false,
        }
    }

    /// Makes this member produce invalid shares.
    pub fn faulty(mut self) -> Self {
        self.faulty = true;
        self
    }

    /// Shares required for recovery.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    fn share_for(&self, peer: PeerIndex, message: &[u8]) -> SignatureShare {
        let digest = Digest::hash_parts(&[b"share:", &self.group, &peer.to_be_bytes(), message]);
        SignatureShare::from_bytes(digest.as_bytes().to_vec())
    }

    fn full(&self, message: &[u8]) -> ThresholdSignature {
        let digest = Digest::hash_parts(&[b"full:", &self.group, message]);
        ThresholdSignature::from_bytes(digest.as_bytes().to_vec())
    }
}

impl KeyShare for MockKeyShare {
    fn sign_share(&self, message: &[u8]) -> SignatureShare {
        if self.faulty {
            let junk = Digest::hash_parts(&[b"junk:", &self.own.to_be_bytes(), message]);
            return SignatureShare::from_bytes(junk.as_bytes().to_vec());
        }
        self.share_for(self.own, message)
    }

    fn verify_share(&self, peer: PeerIndex, message: &[u8], share: &SignatureShare) -> bool {
        peer < self.size && *share == self.share_for(peer, message)
    }

    fn recover_full_signature(
        &self,
        shares: &[(PeerIndex, SignatureShare)],
        message: &[u8],
    ) -> Result<ThresholdSignature> {
        let valid: BTreeSet<PeerIndex> = shares
            .iter()
            .filter(|(peer, share)| self.verify_share(*peer, message, share))
            .map(|(peer, _)| *peer)
            .collect();
        if valid.len() < self.threshold {
            return Err(ConsensusError::Recovery(format!(
                "{} valid shares, {} required",
                valid.len(),
                self.threshold
            )));
        }
        Ok(self.full(message))
    }

    fn verify_full(&self, message: &[u8], signature: &ThresholdSignature) -> bool {
        *signature == self.full(message)
    }
}

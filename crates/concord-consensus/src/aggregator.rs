//! Threshold aggregation of signed results.

use crate::collaborators::KeyShare;
use crate::error::Result;
use crate::transition::StateTransition;
use concord_types::{Digest, PeerIndex, SignatureShare};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// What happened to a contributed share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contribution {
    /// Counted towards the quorum.
    Accepted,
    /// Held until the local result is known.
    Buffered,
    /// The peer already contributed.
    Duplicate,
    /// Signed a different essence than ours.
    DigestMismatch,
    /// The share did not verify.
    InvalidShare,
    /// The sender is not a committee member.
    UnknownPeer,
    /// The round is already finalized.
    AlreadyFinalized,
}

impl Contribution {
    /// Stable name for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Contribution::Accepted => "accepted",
            Contribution::Buffered => "buffered",
            Contribution::Duplicate => "duplicate",
            Contribution::DigestMismatch => "digest_mismatch",
            Contribution::InvalidShare => "invalid_share",
            Contribution::UnknownPeer => "unknown_peer",
            Contribution::AlreadyFinalized => "already_finalized",
        }
    }
}

/// Collects signed results for one round until a quorum can be combined.
///
/// Finalization is one-shot: after the first successful recovery every
/// further share and quorum check is a no-op.
#[derive(Debug)]
pub struct ResultAggregator {
    size: usize,
    quorum: usize,
    transition: Option<StateTransition>,
    shares: Vec<Option<SignatureShare>>,
    early: BTreeMap<PeerIndex, (Digest, SignatureShare)>,
    finalized: bool,
}

impl ResultAggregator {
    /// Creates an aggregator for a committee of `size` with `quorum`.
    pub fn new(size: usize, quorum: usize) -> Self {
        Self {
            size,
            quorum,
            transition: None,
            shares: vec![None; size],
            early: BTreeMap::new(),
            finalized: false,
        }
    }

    /// Digest every contribution must match, once the local result is known.
    pub fn expected_digest(&self) -> Option<Digest> {
        self.transition.as_ref().map(StateTransition::signed_digest)
    }

    /// Number of accepted shares.
    pub fn accepted(&self) -> usize {
        self.shares.iter().filter(|s| s.is_some()).count()
    }

    /// Number of shares waiting for the local result.
    pub fn buffered(&self) -> usize {
        self.early.len()
    }

    /// Returns true once finalized.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The local (possibly signed) transition.
    pub fn transition(&self) -> Option<&StateTransition> {
        self.transition.as_ref()
    }

    /// Installs the local result and share, then validates buffered shares.
    ///
    /// Returns the outcome for each buffered share.
    pub fn set_own_result(
        &mut self,
        own: PeerIndex,
        transition: StateTransition,
        share: SignatureShare,
        keys: &dyn KeyShare,
    ) -> Vec<(PeerIndex, Contribution)> {
        if self.transition.is_some() {
            return Vec::new();
        }
        if let Some(slot) = self.shares.get_mut(usize::from(own)) {
            *slot = Some(share);
        }
        self.transition = Some(transition);
        std::mem::take(&mut self.early)
            .into_iter()
            .map(|(peer, (digest, share))| (peer, self.add(peer, digest, share, keys)))
            .collect()
    }

    /// Adds a peer's signed result.
    pub fn add(
        &mut self,
        peer: PeerIndex,
        digest: Digest,
        share: SignatureShare,
        keys: &dyn KeyShare,
    ) -> Contribution {
        if self.finalized {
            return Contribution::AlreadyFinalized;
        }
        let index = usize::from(peer);
        if index >= self.size {
            return Contribution::UnknownPeer;
        }
        if self.shares[index].is_some() {
            return Contribution::Duplicate;
        }
        let Some(expected) = self.expected_digest() else {
            if self.early.contains_key(&peer) {
                return Contribution::Duplicate;
            }
            self.early.insert(peer, (digest, share));
            return Contribution::Buffered;
        };
        if digest != expected {
            warn!(peer, ours = %expected, theirs = %digest, "Signed result digest mismatch");
            return Contribution::DigestMismatch;
        }
        if !keys.verify_share(peer, expected.as_bytes(), &share) {
            warn!(peer, "Invalid signature share");
            return Contribution::InvalidShare;
        }
        self.shares[index] = Some(share);
        debug!(peer, accepted = self.accepted(), quorum = self.quorum, "Share accepted");
        Contribution::Accepted
    }

    /// Combines the shares once a quorum is reached.
    ///
    /// Returns the signed transition exactly once; `Ok(None)` before quorum
    /// and after finalization.
    pub fn try_finalize(&mut self, keys: &dyn KeyShare) -> Result<Option<StateTransition>> {
        if self.finalized || self.accepted() < self.quorum {
            return Ok(None);
        }
        let Some(transition) = self.transition.as_mut() else {
            return Ok(None);
        };
        let shares: Vec<(PeerIndex, SignatureShare)> = self
            .shares
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let peer = PeerIndex::try_from(i).ok()?;
                s.clone().map(|s| (peer, s))
            })
            .collect();
        let signature = keys.recover_full_signature(&shares, transition.signed_digest().as_bytes())?;
        transition.signature = Some(signature);
        self.finalized = true;
        Ok(Some(transition.clone()))
    }

    /// The share stored for `own`, if the local result is installed.
    pub fn own_share(&self, own: PeerIndex) -> Option<&SignatureShare> {
        self.shares.get(usize::from(own)).and_then(Option::as_ref)
    }
}

//! Baselines: the finalized state a round builds upon.

use crate::id::{BaselineId, Digest};
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a state in the chain's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateIndex(pub u64);

impl StateIndex {
    /// The genesis state index.
    pub const GENESIS: Self = StateIndex(0);

    /// The index following this one.
    pub fn next(self) -> Self {
        StateIndex(self.0.saturating_add(1))
    }
}

impl fmt::Display for StateIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The ledger output that anchors a finalized state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerAnchor {
    /// Ledger-side identifier of the anchoring output.
    pub id: Digest,
    /// Raw anchor bytes as observed on the ledger.
    pub bytes: Vec<u8>,
}

impl LedgerAnchor {
    /// Creates an anchor whose identifier is the hash of its bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self {
            id: Digest::hash(&bytes),
            bytes,
        }
    }
}

/// A previously finalized state together with its ledger anchor.
///
/// Immutable once a round is created from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    /// Index of the finalized state.
    pub state_index: StateIndex,
    /// Commitment to the finalized state.
    pub state_commitment: Digest,
    /// Ledger anchor of the finalized state.
    pub anchor: LedgerAnchor,
    /// Ledger timestamp of the anchor.
    pub timestamp: Timestamp,
}

impl Baseline {
    /// Creates a new baseline.
    pub fn new(
        state_index: StateIndex,
        state_commitment: Digest,
        anchor: LedgerAnchor,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            state_index,
            state_commitment,
            anchor,
            timestamp,
        }
    }

    /// Content identifier of this baseline.
    pub fn id(&self) -> BaselineId {
        BaselineId::new(Digest::hash_parts(&[
            b"baseline:",
            &self.state_index.0.to_be_bytes(),
            self.state_commitment.as_bytes(),
            self.anchor.id.as_bytes(),
            &self.timestamp.to_be_bytes(),
        ]))
    }

    /// Index of the state a round on this baseline produces.
    pub fn target_index(&self) -> StateIndex {
        self.state_index.next()
    }

    /// Returns true if `other` supersedes this baseline.
    pub fn is_superseded_by(&self, other: &Baseline) -> bool {
        other.state_index > self.state_index
    }
}

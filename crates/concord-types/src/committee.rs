//! Committee description as seen by one member.

use crate::error::{Result, TypesError};
use crate::identity::IdentityKey;
use crate::quorum;
use serde::{Deserialize, Serialize};

/// Position of a member within the committee.
pub type PeerIndex = u16;

/// A fixed committee of `n` validators viewed from one member.
///
/// Invariant: `own_index < size` and `quorum <= size`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitteeView {
    size: u16,
    own_index: PeerIndex,
    identities: Vec<IdentityKey>,
}

impl CommitteeView {
    /// Creates a committee view.
    pub fn new(own_index: PeerIndex, identities: Vec<IdentityKey>) -> Result<Self> {
        if identities.is_empty() {
            return Err(TypesError::EmptyCommittee);
        }
        let size = u16::try_from(identities.len()).map_err(|_| TypesError::IdentityCount {
            expected: usize::from(u16::MAX),
            actual: identities.len(),
        })?;
        if own_index >= size {
            return Err(TypesError::IndexOutOfRange {
                index: own_index,
                size,
            });
        }
        Ok(Self {
            size,
            own_index,
            identities,
        })
    }

    /// Committee size `n`.
    pub fn size(&self) -> usize {
        usize::from(self.size)
    }

    /// Binding quorum `n - f`.
    pub fn quorum(&self) -> usize {
        quorum::quorum(self.size())
    }

    /// Maximum tolerated faulty members `f`.
    pub fn max_faulty(&self) -> usize {
        quorum::max_faulty(self.size())
    }

    /// Smallest group guaranteed to contain an honest member.
    pub fn min_fair(&self) -> usize {
        quorum::min_fair(self.size())
    }

    /// This member's index.
    pub fn own_index(&self) -> PeerIndex {
        self.own_index
    }

    /// Returns true if `index` addresses a committee member.
    pub fn contains(&self, index: PeerIndex) -> bool {
        index < self.size
    }

    /// Identity key of the member at `index`.
    pub fn identity(&self, index: PeerIndex) -> Option<&IdentityKey> {
        self.identities.get(usize::from(index))
    }

    /// Iterates over all member indices.
    pub fn indices(&self) -> impl Iterator<Item = PeerIndex> {
        0..self.size
    }

    /// Iterates over all member indices except our own.
    pub fn peers(&self) -> impl Iterator<Item = PeerIndex> + '_ {
        self.indices().filter(move |&i| i != self.own_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerIdentity;

    fn identities(n: u16) -> Vec<IdentityKey> {
        (0..n).map(|i| PeerIdentity::for_devnet(i).public_key()).collect()
    }

    #[test]
    fn test_committee_arithmetic() {
        let view = CommitteeView::new(0, identities(7)).unwrap();
        assert_eq!(view.size(), 7);
        assert_eq!(view.quorum(), 5);
        assert_eq!(view.max_faulty(), 2);
        assert_eq!(view.min_fair(), 3);
    }

    #[test]
    fn test_empty_committee_rejected() {
        assert_eq!(
            CommitteeView::new(0, Vec::new()),
            Err(TypesError::EmptyCommittee)
        );
    }

    #[test]
    fn test_own_index_out_of_range() {
        assert_eq!(
            CommitteeView::new(4, identities(4)),
            Err(TypesError::IndexOutOfRange { index: 4, size: 4 })
        );
    }

    #[test]
    fn test_peers_excludes_self() {
        let view = CommitteeView::new(2, identities(4)).unwrap();
        let peers: Vec<_> = view.peers().collect();
        assert_eq!(peers, vec![0, 1, 3]);
        assert!(view.contains(3));
        assert!(!view.contains(4));
    }
}

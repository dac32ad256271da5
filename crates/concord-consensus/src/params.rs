//! Round parameter agreement.
//!
//! In leader mode the leader fixes timestamp, entropy and fee target on its
//! own and ships them with the start instruction. In common-subset mode
//! every member derives them from the agreed proposals, so all honest
//! members compute identical parameters without further messages.

use crate::batch::select_by_mentions;
use crate::collaborators::KeyShare;
use crate::error::{ConsensusError, Result};
use crate::proposal::BatchProposal;
use concord_types::{Baseline, BaselineId, CommitteeView, Digest, PeerIndex, RequestId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Parameters shared by every member executing a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundParameters {
    /// Round timestamp.
    pub timestamp: Timestamp,
    /// Round entropy.
    pub entropy: Digest,
    /// Fee target applied by the execution engine.
    pub fee_target: String,
}

/// Parameters a leader assigns to its round.
///
/// The timestamp never goes backwards relative to the baseline, even when
/// the leader's clock lags.
pub fn leader_parameters(
    baseline: &Baseline,
    leader: PeerIndex,
    local_time: Timestamp,
    fee_target: &str,
) -> RoundParameters {
    let timestamp = baseline.timestamp.saturating_add_millis(1).max(local_time);
    let entropy = Digest::hash_parts(&[
        baseline.id().as_bytes(),
        &leader.to_be_bytes(),
        &timestamp.to_be_bytes(),
    ]);
    RoundParameters {
        timestamp,
        entropy,
        fee_target: fee_target.to_string(),
    }
}

/// Outcome of common-subset parameter agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreedRound {
    /// Requests to execute, in request-id order.
    pub batch: Vec<RequestId>,
    /// Derived parameters.
    pub params: RoundParameters,
    /// Proposers whose proposals were accepted, ascending.
    pub accepted: Vec<PeerIndex>,
    /// Proposer whose hints govern the round.
    pub selected: PeerIndex,
}

/// Derives the batch and parameters from an agreed set of proposals.
///
/// Proposals for another baseline, from unknown members, with a bad
/// identity signature or an invalid threshold share are dropped. Only the
/// first proposal per member counts.
pub fn agree_on_subset(
    proposals: &[BatchProposal],
    baseline_id: &BaselineId,
    committee: &CommitteeView,
    keys: &dyn KeyShare,
) -> Result<AgreedRound> {
    let message = baseline_id.as_bytes();
    let mut accepted: BTreeMap<PeerIndex, &BatchProposal> = BTreeMap::new();
    for proposal in proposals {
        let peer = proposal.proposer;
        let reason = if proposal.baseline_id != *baseline_id {
            Some("baseline mismatch")
        } else if accepted.contains_key(&peer) {
            Some("duplicate proposer")
        } else if !proposal.verify_identity(committee) {
            Some("bad identity signature")
        } else if !keys.verify_share(peer, message, &proposal.share) {
            Some("invalid share")
        } else {
            None
        };
        match reason {
            Some(reason) => debug!(peer, reason, "Dropping proposal"),
            None => {
                accepted.insert(peer, proposal);
            }
        }
    }

    let need = committee.quorum();
    if accepted.len() < need {
        return Err(ConsensusError::InsufficientShares {
            have: accepted.len(),
            need,
        });
    }

    let mut timestamps: Vec<Timestamp> = accepted.values().map(|p| p.hints.timestamp).collect();
    timestamps.sort_unstable();
    let timestamp = timestamps[timestamps.len() / 2];

    let shares: Vec<_> = accepted
        .iter()
        .map(|(peer, p)| (*peer, p.share.clone()))
        .collect();
    let signature = keys.recover_full_signature(&shares, message)?;
    let entropy = signature.digest();

    let ordered: Vec<&BatchProposal> = accepted.values().copied().collect();
    let index = Digest::hash(entropy.as_bytes()).prefix_u64() % ordered.len() as u64;
    let chosen = ordered[index as usize];

    let batch = select_by_mentions(
        ordered.iter().map(|p| p.request_ids.as_slice()),
        committee.size(),
    );

    Ok(AgreedRound {
        batch,
        params: RoundParameters {
            timestamp,
            entropy,
            fee_target: chosen.hints.fee_target.clone(),
        },
        accepted: accepted.keys().copied().collect(),
        selected: chosen.proposer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::ProposalHints;
    use crate::testing::MockKeyShare;
    use concord_types::{IdentityKey, LedgerAnchor, PeerIdentity, StateIndex};

    const GROUP: &[u8] = b"params-test";

    fn committee(n: u16) -> CommitteeView {
        let keys: Vec<IdentityKey> = (0..n)
            .map(|i| PeerIdentity::for_devnet(i).public_key())
            .collect();
        CommitteeView::new(0, keys).unwrap()
    }

    fn baseline() -> Baseline {
        Baseline::new(
            StateIndex(4),
            Digest::hash(b"state"),
            LedgerAnchor::from_bytes(b"anchor".to_vec()),
            Timestamp::from_millis(1_000),
        )
    }

    fn proposal(peer: PeerIndex, ts: u64, requests: &[&[u8]]) -> BatchProposal {
        let baseline_id = baseline().id();
        let keys = MockKeyShare::new(GROUP, 4, peer);
        BatchProposal::new(
            &PeerIdentity::for_devnet(peer),
            peer,
            baseline_id,
            0,
            requests.iter().map(|r| RequestId::derive(r)).collect(),
            ProposalHints {
                timestamp: Timestamp::from_millis(ts),
                fee_target: format!("fee-{peer}"),
            },
            keys.sign_share(baseline_id.as_bytes()),
        )
    }

    #[test]
    fn test_leader_timestamp_monotonic() {
        let b = baseline();
        let lagging = leader_parameters(&b, 0, Timestamp::from_millis(10), "base");
        assert_eq!(lagging.timestamp, Timestamp::from_millis(1_001));

        let ahead = leader_parameters(&b, 0, Timestamp::from_millis(5_000), "base");
        assert_eq!(ahead.timestamp, Timestamp::from_millis(5_000));
    }

    #[test]
    fn test_leader_entropy_depends_on_leader() {
        let b = baseline();
        let now = Timestamp::from_millis(5_000);
        assert_ne!(
            leader_parameters(&b, 0, now, "base").entropy,
            leader_parameters(&b, 1, now, "base").entropy
        );
    }

    #[test]
    fn test_subset_agreement() {
        let proposals = vec![
            proposal(0, 100, &[b"a", b"b"]),
            proposal(1, 300, &[b"a"]),
            proposal(2, 200, &[b"b", b"c"]),
        ];
        let keys = MockKeyShare::new(GROUP, 4, 3);
        let agreed = agree_on_subset(&proposals, &baseline().id(), &committee(4), &keys).unwrap();

        assert_eq!(agreed.params.timestamp, Timestamp::from_millis(200));
        assert_eq!(agreed.accepted, vec![0, 1, 2]);
        let mut expected = vec![RequestId::derive(b"a"), RequestId::derive(b"b")];
        expected.sort();
        assert_eq!(agreed.batch, expected);
        assert_eq!(agreed.params.fee_target, format!("fee-{}", agreed.selected));
    }

    #[test]
    fn test_agreement_independent_of_delivery_order() {
        let mut proposals = vec![
            proposal(0, 100, &[b"a"]),
            proposal(1, 300, &[b"a"]),
            proposal(2, 200, &[b"a"]),
            proposal(3, 400, &[b"b"]),
        ];
        let keys = MockKeyShare::new(GROUP, 4, 0);
        let first = agree_on_subset(&proposals, &baseline().id(), &committee(4), &keys).unwrap();
        proposals.reverse();
        let second = agree_on_subset(&proposals, &baseline().id(), &committee(4), &keys).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_share_dropped() {
        let mut bad = proposal(3, 100, &[b"a"]);
        bad.share = concord_types::SignatureShare::from_bytes(vec![0u8; 32]);
        let identity = PeerIdentity::for_devnet(3);
        bad.signature = identity.sign(&bad.signing_data());

        let proposals = vec![
            proposal(0, 100, &[b"a"]),
            proposal(1, 100, &[b"a"]),
            proposal(2, 100, &[b"a"]),
            bad,
        ];
        let keys = MockKeyShare::new(GROUP, 4, 0);
        let agreed = agree_on_subset(&proposals, &baseline().id(), &committee(4), &keys).unwrap();
        assert_eq!(agreed.accepted, vec![0, 1, 2]);
    }

    #[test]
    fn test_insufficient_shares() {
        let proposals = vec![proposal(0, 100, &[b"a"]), proposal(1, 100, &[b"a"])];
        let keys = MockKeyShare::new(GROUP, 4, 0);
        let err = agree_on_subset(&proposals, &baseline().id(), &committee(4), &keys).unwrap_err();
        assert!(matches!(
            err,
            ConsensusError::InsufficientShares { have: 2, need: 3 }
        ));
    }

    #[test]
    fn test_duplicate_proposer_counts_once() {
        let proposals = vec![
            proposal(0, 100, &[b"a"]),
            proposal(0, 100, &[b"a"]),
            proposal(1, 100, &[b"a"]),
        ];
        let keys = MockKeyShare::new(GROUP, 4, 0);
        let err = agree_on_subset(&proposals, &baseline().id(), &committee(4), &keys).unwrap_err();
        assert!(matches!(err, ConsensusError::InsufficientShares { .. }));
    }
}

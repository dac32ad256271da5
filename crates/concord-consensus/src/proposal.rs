//! Batch proposals for common-subset agreement.

use concord_types::{
    BaselineId, CommitteeView, IdentitySignature, PeerIdentity, PeerIndex, RequestId,
    SignatureShare, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Round-parameter hints carried by a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalHints {
    /// Proposer's view of the round timestamp.
    pub timestamp: Timestamp,
    /// Fee target the proposer would apply.
    pub fee_target: String,
}

/// A member's signed input to common-subset agreement.
///
/// `share` is the proposer's threshold share over the baseline id; the
/// combined shares of the accepted proposals become the round's entropy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProposal {
    /// Proposer's committee index.
    pub proposer: PeerIndex,
    /// Baseline the proposal builds on.
    pub baseline_id: BaselineId,
    /// Proposal attempt within the round.
    pub attempt: u32,
    /// Requests the proposer has ready.
    pub request_ids: Vec<RequestId>,
    /// Parameter hints.
    pub hints: ProposalHints,
    /// Threshold share over the baseline id.
    pub share: SignatureShare,
    /// Proposer's identity signature over all fields above.
    pub signature: IdentitySignature,
}

impl BatchProposal {
    /// Creates and signs a proposal.
    pub fn new(
        identity: &PeerIdentity,
        proposer: PeerIndex,
        baseline_id: BaselineId,
        attempt: u32,
        request_ids: Vec<RequestId>,
        hints: ProposalHints,
        share: SignatureShare,
    ) -> Self {
        let mut proposal = Self {
            proposer,
            baseline_id,
            attempt,
            request_ids,
            hints,
            share,
            signature: IdentitySignature(String::new()),
        };
        proposal.signature = identity.sign(&proposal.signing_data());
        proposal
    }

    /// Returns the data covered by the identity signature.
    pub fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"PROPOSAL:");
        data.extend_from_slice(&self.proposer.to_be_bytes());
        data.extend_from_slice(self.baseline_id.as_bytes());
        data.extend_from_slice(&self.attempt.to_be_bytes());
        data.extend_from_slice(&(self.request_ids.len() as u64).to_be_bytes());
        for id in &self.request_ids {
            data.extend_from_slice(id.as_bytes());
        }
        data.extend_from_slice(&self.hints.timestamp.to_be_bytes());
        data.extend_from_slice(&(self.hints.fee_target.len() as u64).to_be_bytes());
        data.extend_from_slice(self.hints.fee_target.as_bytes());
        data.extend_from_slice(self.share.as_bytes());
        data
    }

    /// Verifies the identity signature against the committee.
    pub fn verify_identity(&self, committee: &CommitteeView) -> bool {
        committee
            .identity(self.proposer)
            .is_some_and(|key| key.verify(&self.signing_data(), &self.signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::{Digest, IdentityKey};

    fn committee(n: u16) -> CommitteeView {
        let keys: Vec<IdentityKey> = (0..n)
            .map(|i| PeerIdentity::for_devnet(i).public_key())
            .collect();
        CommitteeView::new(0, keys).unwrap()
    }

    fn proposal(proposer: PeerIndex) -> BatchProposal {
        BatchProposal::new(
            &PeerIdentity::for_devnet(proposer),
            proposer,
            BaselineId::new(Digest::hash(b"baseline")),
            0,
            vec![RequestId::derive(b"r1")],
            ProposalHints {
                timestamp: Timestamp::from_millis(10),
                fee_target: "base".into(),
            },
            SignatureShare::from_bytes(vec![proposer as u8; 32]),
        )
    }

    #[test]
    fn test_signed_proposal_verifies() {
        assert!(proposal(2).verify_identity(&committee(4)));
    }

    #[test]
    fn test_tampered_proposal_rejected() {
        let mut p = proposal(2);
        p.request_ids.push(RequestId::derive(b"r2"));
        assert!(!p.verify_identity(&committee(4)));
    }

    #[test]
    fn test_impersonation_rejected() {
        let mut p = proposal(2);
        p.proposer = 1;
        assert!(!p.verify_identity(&committee(4)));
    }

    #[test]
    fn test_unknown_proposer_rejected() {
        let p = proposal(5);
        assert!(!p.verify_identity(&committee(4)));
    }
}

//! The finalized state transition posted to the ledger.

use concord_types::{
    BaselineId, Digest, RequestId, StateIndex, ThresholdSignature, Timestamp, TransactionId,
};
use serde::{Deserialize, Serialize};

/// Opaque execution output that members sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEssence(pub Vec<u8>);

impl ResultEssence {
    /// Digest covered by the threshold signature.
    pub fn digest(&self) -> Digest {
        Digest::hash_parts(&[b"essence:", &self.0])
    }
}

/// The state a round produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultState {
    /// Index of the new state.
    pub state_index: StateIndex,
    /// Commitment to the new state.
    pub commitment: Digest,
}

/// A round's output: what was executed on which baseline and the state it
/// led to. Carries the full threshold signature once finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Baseline the round built on.
    pub baseline_id: BaselineId,
    /// Resulting state.
    pub state: ResultState,
    /// Digest of the signed result essence.
    pub essence_digest: Digest,
    /// Executed requests, in batch order.
    pub requests: Vec<RequestId>,
    /// Agreed round timestamp.
    pub timestamp: Timestamp,
    /// Full threshold signature over [`StateTransition::signed_digest`].
    pub signature: Option<ThresholdSignature>,
}

impl StateTransition {
    /// Creates an unsigned transition.
    pub fn new(
        baseline_id: BaselineId,
        state: ResultState,
        essence_digest: Digest,
        requests: Vec<RequestId>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            baseline_id,
            state,
            essence_digest,
            requests,
            timestamp,
            signature: None,
        }
    }

    /// Identifier over the unsigned content.
    ///
    /// Independent of the signature so members can refer to the same
    /// transaction before and after aggregation.
    pub fn id(&self) -> TransactionId {
        let index = self.state.state_index.0.to_be_bytes();
        let timestamp = self.timestamp.to_be_bytes();
        let mut parts: Vec<&[u8]> = vec![
            b"transition:",
            self.baseline_id.as_bytes(),
            &index,
            self.state.commitment.as_bytes(),
            self.essence_digest.as_bytes(),
            &timestamp,
        ];
        parts.extend(self.requests.iter().map(|id| id.as_bytes().as_slice()));
        TransactionId::new(Digest::hash_parts(&parts))
    }

    /// Digest the threshold signature covers: every unsigned field.
    pub fn signed_digest(&self) -> Digest {
        *self.id().digest()
    }

    /// Returns true once a full signature is attached.
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition() -> StateTransition {
        StateTransition::new(
            BaselineId::new(Digest::hash(b"b")),
            ResultState {
                state_index: StateIndex(2),
                commitment: Digest::hash(b"state"),
            },
            ResultEssence(b"essence".to_vec()).digest(),
            vec![RequestId::derive(b"r")],
            Timestamp::from_millis(5),
        )
    }

    #[test]
    fn test_id_ignores_signature() {
        let unsigned = transition();
        let mut signed = transition();
        signed.signature = Some(ThresholdSignature::from_bytes(vec![1, 2, 3]));

        assert_eq!(unsigned.id(), signed.id());
        assert!(signed.is_signed());
        assert!(!unsigned.is_signed());
    }

    #[test]
    fn test_id_covers_requests() {
        let a = transition();
        let mut b = transition();
        b.requests.clear();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_signed_digest_covers_state_and_requests() {
        let genuine = transition();

        let mut state = transition();
        state.state.commitment = Digest::hash(b"forged");
        let mut requests = transition();
        requests.requests.push(RequestId::derive(b"extra"));
        let mut timestamp = transition();
        timestamp.timestamp = Timestamp::from_millis(6);

        for forged in [state, requests, timestamp] {
            assert_eq!(forged.essence_digest, genuine.essence_digest);
            assert_ne!(forged.signed_digest(), genuine.signed_digest());
        }
    }
}

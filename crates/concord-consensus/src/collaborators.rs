//! Capabilities the engine consumes.
//!
//! The engine never owns a transport, a key, a ledger connection or a
//! request store. It holds narrow handles to them and reacts to what they
//! report. Only execution is asynchronous; its completion re-enters the
//! engine as an event.

use crate::error::Result;
use crate::message::MessageKind;
use crate::proposal::BatchProposal;
use crate::transition::{ResultEssence, ResultState, StateTransition};
use async_trait::async_trait;
use bytes::Bytes;
use concord_types::{
    Baseline, BaselineId, Digest, PeerIndex, Request, RequestId, SignatureShare, ThresholdSignature,
    Timestamp, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Everything the execution engine needs to compute a round's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionInput {
    /// Baseline to execute on.
    pub baseline: Baseline,
    /// Requests in batch order.
    pub requests: Vec<Request>,
    /// Agreed round timestamp.
    pub timestamp: Timestamp,
    /// Agreed round entropy.
    pub entropy: Digest,
    /// Agreed fee target.
    pub fee_target: String,
}

impl ExecutionInput {
    /// Request identifiers in batch order.
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(|r| r.id).collect()
    }
}

/// Output of a successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Data every member signs.
    pub essence: ResultEssence,
    /// Resulting state.
    pub state: ResultState,
}

/// Computes the result of applying a batch to a baseline.
///
/// Implementations must be deterministic: honest members given the same
/// input produce the same essence.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Executes one batch.
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput>;
}

/// Point-to-point and broadcast messaging plus liveness reports.
pub trait PeerTransport: Send + Sync {
    /// Sends a payload to one peer. Delivery is best-effort.
    fn send_to(&self, peer: PeerIndex, kind: MessageKind, payload: Bytes);

    /// Sends a payload to every other committee member.
    fn broadcast(&self, kind: MessageKind, payload: Bytes, timestamp: Timestamp);

    /// Whether `peer` is currently considered alive.
    fn is_alive(&self, peer: PeerIndex) -> bool;

    /// Whether at least a quorum of the committee is alive.
    fn quorum_alive(&self) -> bool;
}

/// This member's share of the committee's threshold key.
pub trait KeyShare: Send + Sync {
    /// Signs `message` with the local share.
    fn sign_share(&self, message: &[u8]) -> SignatureShare;

    /// Verifies a share produced by `peer`.
    fn verify_share(&self, peer: PeerIndex, message: &[u8], share: &SignatureShare) -> bool;

    /// Combines at least a quorum of valid shares into a full signature.
    fn recover_full_signature(
        &self,
        shares: &[(PeerIndex, SignatureShare)],
        message: &[u8],
    ) -> Result<ThresholdSignature>;

    /// Verifies a full signature under the committee's combined key.
    fn verify_full(&self, message: &[u8], signature: &ThresholdSignature) -> bool;
}

/// Ledger view of a posted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InclusionState {
    /// Not yet decided.
    Pending,
    /// Included and confirmed.
    Confirmed,
    /// Refused by the ledger.
    Rejected,
}

/// Access to the external ledger.
pub trait LedgerClient: Send + Sync {
    /// Submits a finalized transition.
    fn post_transaction(&self, transition: &StateTransition);

    /// Reports inclusion of a previously posted transition.
    fn poll_inclusion_state(&self, id: &TransactionId) -> InclusionState;
}

/// Source of pending requests.
pub trait RequestPool: Send + Sync {
    /// Identifiers of requests ready for execution.
    fn ready_requests(&self) -> Vec<RequestId>;

    /// Records that `peer` reported `id` as ready.
    fn mark_seen(&self, id: &RequestId, peer: PeerIndex);

    /// Returns the requests for `ids` that are present, and whether all were.
    ///
    /// The engine re-orders the result into batch order, so implementations
    /// may return them in any order.
    fn take_ready(&self, ids: &[RequestId]) -> (Vec<Request>, bool);
}

/// The proposals a common-subset instance agreed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsetDecision {
    /// Baseline the instance ran for.
    pub baseline_id: BaselineId,
    /// Proposal attempt within the round.
    pub attempt: u32,
    /// Agreed proposals, at least a quorum of them.
    pub proposals: Vec<BatchProposal>,
}

/// Common-subset agreement over batch proposals.
///
/// The agreed set is delivered back to the engine as a
/// [`Event::SubsetAgreed`](crate::engine::Event::SubsetAgreed) carrying a
/// [`SubsetDecision`].
pub trait CommonSubset: Send + Sync {
    /// Submits this member's proposal.
    fn propose(&self, proposal: BatchProposal);
}

/// The synchronous capabilities a consensus engine is wired to.
#[derive(Clone)]
pub struct Collaborators {
    /// Peer messaging and liveness.
    pub transport: Arc<dyn PeerTransport>,
    /// Threshold key share.
    pub keys: Arc<dyn KeyShare>,
    /// Ledger access.
    pub ledger: Arc<dyn LedgerClient>,
    /// Pending requests.
    pub pool: Arc<dyn RequestPool>,
    /// Common-subset agreement.
    pub subset: Arc<dyn CommonSubset>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

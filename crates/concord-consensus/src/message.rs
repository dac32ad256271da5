//! Peer messages exchanged during a round.
//!
//! The transport carries the message kind alongside an opaque payload, so
//! payloads are encoded per kind rather than as a tagged envelope.

use crate::batch::batch_hash;
use crate::error::{ConsensusError, Result};
use crate::params::RoundParameters;
use crate::transition::StateTransition;
use bytes::Bytes;
use concord_types::{BaselineId, Digest, RequestId, SignatureShare};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of peer messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Subordinate to leader: requests the sender has ready.
    NotifyRequests,
    /// Leader to all: execute this batch with these parameters.
    StartProcessing,
    /// Member to aggregator: partial signature over the result.
    SignedResult,
    /// Leader to all: the finalized transition was posted.
    ResultPosted,
}

impl MessageKind {
    /// Every kind, in a fixed order.
    pub const ALL: [MessageKind; 4] = [
        MessageKind::NotifyRequests,
        MessageKind::StartProcessing,
        MessageKind::SignedResult,
        MessageKind::ResultPosted,
    ];

    /// Returns the kind as a string for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::NotifyRequests => "notify_requests",
            MessageKind::StartProcessing => "start_processing",
            MessageKind::SignedResult => "signed_result",
            MessageKind::ResultPosted => "result_posted",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests a member has ready on a baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyRequests {
    /// Baseline of the sender's round.
    pub baseline_id: BaselineId,
    /// Ready request identifiers.
    pub request_ids: Vec<RequestId>,
}

/// A leader's instruction to execute a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartProcessing {
    /// Baseline of the leader's round.
    pub baseline_id: BaselineId,
    /// Batch in execution order.
    pub request_ids: Vec<RequestId>,
    /// Hash of `request_ids`.
    pub batch_hash: Digest,
    /// Round parameters.
    pub params: RoundParameters,
}

impl StartProcessing {
    /// Creates an instruction, computing the batch hash.
    pub fn new(baseline_id: BaselineId, request_ids: Vec<RequestId>, params: RoundParameters) -> Self {
        let batch_hash = batch_hash(&request_ids);
        Self {
            baseline_id,
            request_ids,
            batch_hash,
            params,
        }
    }

    /// Returns true if the carried hash matches the batch.
    pub fn is_consistent(&self) -> bool {
        batch_hash(&self.request_ids) == self.batch_hash
    }
}

/// A member's partial signature over its unsigned transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedResult {
    /// Baseline of the sender's round.
    pub baseline_id: BaselineId,
    /// Digest that was signed.
    pub digest: Digest,
    /// The partial signature.
    pub share: SignatureShare,
}

/// Notice that the finalized transition was posted to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPosted {
    /// Baseline of the sender's round.
    pub baseline_id: BaselineId,
    /// The signed transition.
    pub transition: StateTransition,
}

/// A decoded peer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// See [`NotifyRequests`].
    NotifyRequests(NotifyRequests),
    /// See [`StartProcessing`].
    StartProcessing(StartProcessing),
    /// See [`SignedResult`].
    SignedResult(SignedResult),
    /// See [`ResultPosted`].
    ResultPosted(ResultPosted),
}

impl PeerMessage {
    /// The kind the transport should carry.
    pub fn kind(&self) -> MessageKind {
        match self {
            PeerMessage::NotifyRequests(_) => MessageKind::NotifyRequests,
            PeerMessage::StartProcessing(_) => MessageKind::StartProcessing,
            PeerMessage::SignedResult(_) => MessageKind::SignedResult,
            PeerMessage::ResultPosted(_) => MessageKind::ResultPosted,
        }
    }

    /// Baseline the message refers to.
    pub fn baseline_id(&self) -> &BaselineId {
        match self {
            PeerMessage::NotifyRequests(m) => &m.baseline_id,
            PeerMessage::StartProcessing(m) => &m.baseline_id,
            PeerMessage::SignedResult(m) => &m.baseline_id,
            PeerMessage::ResultPosted(m) => &m.baseline_id,
        }
    }

    /// Encodes the payload.
    pub fn encode(&self) -> Result<Bytes> {
        let json = match self {
            PeerMessage::NotifyRequests(m) => serde_json::to_vec(m),
            PeerMessage::StartProcessing(m) => serde_json::to_vec(m),
            PeerMessage::SignedResult(m) => serde_json::to_vec(m),
            PeerMessage::ResultPosted(m) => serde_json::to_vec(m),
        }
        .map_err(|e| ConsensusError::Encoding(e.to_string()))?;
        Ok(Bytes::from(json))
    }

    /// Decodes a payload of the given kind.
    pub fn decode(kind: MessageKind, payload: &[u8]) -> Result<Self> {
        Ok(match kind {
            MessageKind::NotifyRequests => PeerMessage::NotifyRequests(parse(kind, payload)?),
            MessageKind::StartProcessing => PeerMessage::StartProcessing(parse(kind, payload)?),
            MessageKind::SignedResult => PeerMessage::SignedResult(parse(kind, payload)?),
            MessageKind::ResultPosted => PeerMessage::ResultPosted(parse(kind, payload)?),
        })
    }
}

fn parse<T: DeserializeOwned>(kind: MessageKind, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| ConsensusError::MalformedPayload {
        kind: kind.as_str(),
        reason: e.to_string(),
    })
}

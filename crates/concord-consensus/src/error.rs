//! Consensus error types.

use concord_types::{PeerIndex, TypesError};
use thiserror::Error;

/// Errors that can occur during consensus operations.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Fewer valid signature shares than the quorum requires.
    #[error("insufficient shares: have {have}, need {need}")]
    InsufficientShares {
        /// Valid shares available.
        have: usize,
        /// Required shares (quorum).
        need: usize,
    },

    /// Invalid batch proposal.
    #[error("invalid proposal from peer {peer}: {reason}")]
    InvalidProposal {
        /// Proposer index.
        peer: PeerIndex,
        /// Why the proposal was rejected.
        reason: String,
    },

    /// A peer payload could not be decoded.
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload {
        /// Message kind the payload claimed to be.
        kind: &'static str,
        /// Decoder error.
        reason: String,
    },

    /// The signing identity does not match the committee entry.
    #[error("identity does not match committee member {index}")]
    IdentityMismatch {
        /// Own committee index.
        index: PeerIndex,
    },

    /// Payload encoding failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The key-share capability failed to recover a full signature.
    #[error("signature recovery failed: {0}")]
    Recovery(String),

    /// The execution engine failed to produce a result.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The engine task has stopped and no longer accepts events.
    #[error("engine stopped")]
    EngineStopped,

    /// Underlying type error.
    #[error(transparent)]
    Types(#[from] TypesError),
}

/// A specialized Result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;

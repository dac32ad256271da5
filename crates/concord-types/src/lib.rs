//! Common types used throughout `concord`.
//!
//! This crate provides the identifiers, committee description and quorum
//! arithmetic shared by the consensus engine and the node.

mod baseline;
mod committee;
mod error;
mod id;
mod identity;
pub mod quorum;
mod request;
mod signature;
mod timestamp;

pub use baseline::{Baseline, LedgerAnchor, StateIndex};
pub use committee::{CommitteeView, PeerIndex};
pub use error::{Result, TypesError};
pub use id::{BaselineId, Digest, RequestId, TransactionId};
pub use identity::{IdentityKey, IdentitySignature, PeerIdentity};
pub use request::{Request, RequestKind};
pub use signature::{SignatureShare, ThresholdSignature};
pub use timestamp::Timestamp;

/// The unique namespace prefix used in all signing operations to prevent signature replay attacks.
pub const NAMESPACE: &[u8] = b"_CONCORD";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _: RequestId;
        let _: BaselineId;
        assert_eq!(quorum::quorum(4), 3);
    }
}

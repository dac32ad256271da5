//! Requests submitted to a chain.

use crate::id::{Digest, RequestId};
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};

/// Where a request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Carried by a ledger output; solid once the output is confirmed.
    OnLedger,
    /// Submitted directly to a node's API.
    OffLedger,
}

/// A request awaiting execution. Immutable once observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Content identifier.
    pub id: RequestId,
    /// Origin of the request.
    pub kind: RequestKind,
    /// Opaque call data interpreted by the execution engine.
    pub payload: Vec<u8>,
    /// Earliest time at which the request may be executed.
    pub time_lock: Option<Timestamp>,
}

impl Request {
    /// Creates a request whose identifier is derived from its content.
    pub fn new(kind: RequestKind, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        let tag: &[u8] = match kind {
            RequestKind::OnLedger => b"on",
            RequestKind::OffLedger => b"off",
        };
        let id = RequestId::new(Digest::hash_parts(&[b"request:", tag, &payload]));
        Self {
            id,
            kind,
            payload,
            time_lock: None,
        }
    }

    /// Sets the time lock.
    pub fn with_time_lock(mut self, time_lock: Timestamp) -> Self {
        self.time_lock = Some(time_lock);
        self
    }

    /// Returns true if the time lock (if any) has expired at `now`.
    pub fn is_unlocked(&self, now: Timestamp) -> bool {
        self.time_lock.map_or(true, |lock| lock <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_depends_on_kind_and_payload() {
        let a = Request::new(RequestKind::OffLedger, b"call".to_vec());
        let b = Request::new(RequestKind::OnLedger, b"call".to_vec());
        let c = Request::new(RequestKind::OffLedger, b"call".to_vec());

        assert_ne!(a.id, b.id);
        assert_eq!(a.id, c.id);
    }

    #[test]
    fn test_time_lock() {
        let req = Request::new(RequestKind::OffLedger, b"x".to_vec())
            .with_time_lock(Timestamp::from_millis(100));

        assert!(!req.is_unlocked(Timestamp::from_millis(99)));
        assert!(req.is_unlocked(Timestamp::from_millis(100)));
    }
}

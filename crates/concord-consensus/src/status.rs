//! Externally visible engine state.
//!
//! The round itself is owned by the engine task. What the outside world may
//! look at is copied out after every step: a snapshot published through an
//! [`ArcSwap`] and the in-flight request bookkeeping behind its own lock.

use crate::collaborators::InclusionState;
use crate::config::AgreementMode;
use crate::stage::Stage;
use arc_swap::ArcSwap;
use concord_types::{BaselineId, PeerIndex, RequestId, StateIndex, Timestamp, TransactionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Counts of round-local work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    /// Requests the pool reported ready at the last step.
    pub ready_requests: usize,
    /// Distinct requests with at least one notification.
    pub notified_requests: usize,
    /// Requests in the batch being executed or signed.
    pub in_flight_requests: usize,
    /// Accepted signed results, including our own.
    pub signed_results: usize,
}

/// Point-in-time view of an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Committee index of the engine.
    pub node: PeerIndex,
    /// Target state index of the current round, if any.
    pub round_index: Option<StateIndex>,
    /// Baseline of the current round.
    pub baseline_id: Option<BaselineId>,
    /// Active stage.
    pub stage: Stage,
    /// Agreement mode of the current round.
    pub mode: AgreementMode,
    /// Current leader in leader mode.
    pub leader: Option<PeerIndex>,
    /// Rotations performed in the current round.
    pub rotations: u32,
    /// Whether the transport reports a live quorum.
    pub quorum_alive: bool,
    /// Work counters.
    pub pending: PendingCounts,
    /// Transition finalized or observed in this round.
    pub finalized_tx: Option<TransactionId>,
    /// Last known ledger state of `finalized_tx`.
    pub inclusion: Option<InclusionState>,
}

impl StatusSnapshot {
    /// Snapshot of an engine without a round.
    pub fn idle(node: PeerIndex) -> Self {
        Self {
            node,
            round_index: None,
            baseline_id: None,
            stage: Stage::Idle,
            mode: AgreementMode::Leader,
            leader: None,
            rotations: 0,
            quorum_alive: false,
            pending: PendingCounts::default(),
            finalized_tx: None,
            inclusion: None,
        }
    }
}

/// Lock-free holder of the latest snapshot.
#[derive(Debug)]
pub struct StatusCell {
    current: ArcSwap<StatusSnapshot>,
}

impl StatusCell {
    /// Creates a cell holding an idle snapshot.
    pub fn new(node: PeerIndex) -> Self {
        Self {
            current: ArcSwap::from_pointee(StatusSnapshot::idle(node)),
        }
    }

    /// Replaces the published snapshot.
    pub fn publish(&self, snapshot: StatusSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    /// Returns the latest snapshot.
    pub fn load(&self) -> Arc<StatusSnapshot> {
        self.current.load_full()
    }
}

#[derive(Debug, Default)]
struct InFlight {
    requests: BTreeSet<RequestId>,
    since: Option<Timestamp>,
}

/// Requests currently being executed or signed by this engine.
///
/// Written only by the engine step; read by API handlers.
#[derive(Debug, Default)]
pub struct RequestTracker {
    inner: RwLock<InFlight>,
}

impl RequestTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `requests` as in flight.
    pub fn begin(&self, requests: &[RequestId], at: Timestamp) {
        let mut inner = self.inner.write();
        inner.requests = requests.iter().copied().collect();
        inner.since = Some(at);
    }

    /// Clears the in-flight set.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.requests.clear();
        inner.since = None;
    }

    /// Returns true if `id` is in flight.
    pub fn is_in_flight(&self, id: &RequestId) -> bool {
        self.inner.read().requests.contains(id)
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.inner.read().requests.len()
    }

    /// Returns true if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.inner.read().requests.is_empty()
    }

    /// In-flight requests in id order.
    pub fn in_flight(&self) -> Vec<RequestId> {
        self.inner.read().requests.iter().copied().collect()
    }

    /// When the current batch started.
    pub fn since(&self) -> Option<Timestamp> {
        self.inner.read().since
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_cell_publishes() {
        let cell = StatusCell::new(3);
        assert_eq!(cell.load().stage, Stage::Idle);

        let mut next = StatusSnapshot::idle(3);
        next.stage = Stage::SubNotified;
        next.rotations = 2;
        cell.publish(next.clone());

        assert_eq!(*cell.load(), next);
    }

    #[test]
    fn test_tracker() {
        let tracker = RequestTracker::new();
        let a = RequestId::derive(b"a");
        tracker.begin(&[a], Timestamp::from_millis(5));

        assert!(tracker.is_in_flight(&a));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.since(), Some(Timestamp::from_millis(5)));

        tracker.clear();
        assert!(tracker.is_empty());
        assert_eq!(tracker.since(), None);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(StatusSnapshot::idle(1)).unwrap();
        assert_eq!(json["stage"], "idle");
        assert_eq!(json["mode"], "leader");
    }
}

//! In-memory request pool.

use crate::collaborators::RequestPool;
use concord_types::{PeerIndex, Request, RequestId, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A request pool backed by maps.
///
/// Requests stay in the pool until [`MemoryPool::remove`] is called, which
/// the owner does once they are confirmed on the ledger.
#[derive(Debug, Default)]
pub struct MemoryPool {
    requests: RwLock<BTreeMap<RequestId, Request>>,
    seen: RwLock<HashMap<RequestId, BTreeSet<PeerIndex>>>,
}

impl MemoryPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a request.
    pub fn add(&self, request: Request) {
        self.requests.write().insert(request.id, request);
    }

    /// Removes requests, typically after confirmation.
    pub fn remove(&self, ids: &[RequestId]) {
        let mut requests = self.requests.write();
        let mut seen = self.seen.write();
        for id in ids {
            requests.remove(id);
            seen.remove(id);
        }
    }

    /// Number of requests held.
    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.requests.read().is_empty()
    }

    /// Whether `id` is held.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.requests.read().contains_key(id)
    }

    /// Peers that reported `id` as ready.
    pub fn seen_by(&self, id: &RequestId) -> BTreeSet<PeerIndex> {
        self.seen.read().get(id).cloned().unwrap_or_default()
    }
}

impl RequestPool for MemoryPool {
    fn ready_requests(&self) -> Vec<RequestId> {
        let now = Timestamp::now();
        self.requests
            .read()
            .values()
            .filter(|r| r.is_unlocked(now))
            .map(|r| r.id)
            .collect()
    }

    fn mark_seen(&self, id: &RequestId, peer: PeerIndex) {
        self.seen.write().entry(*id).or_default().insert(peer);
    }

    fn take_ready(&self, ids: &[RequestId]) -> (Vec<Request>, bool) {
        let requests = self.requests.read();
        let found: Vec<Request> = ids.iter().filter_map(|id| requests.get(id).cloned()).collect();
        let all = found.len() == ids.len();
        (found, all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::RequestKind;

    #[test]
    fn test_time_locked_requests_are_not_ready() {
        let pool = MemoryPool::new();
        let open = Request::new(RequestKind::OffLedger, b"open".to_vec());
        let locked = Request::new(RequestKind::OnLedger, b"locked".to_vec())
            .with_time_lock(Timestamp::from_millis(u64::MAX));
        pool.add(open.clone());
        pool.add(locked.clone());

        assert_eq!(pool.ready_requests(), vec![open.id]);
        let (found, all) = pool.take_ready(&[open.id, RequestId::derive(b"missing")]);
        assert_eq!(found.len(), 1);
        assert!(!all);
    }
}

//! Batch selection.
//!
//! Two selectors exist. In leader mode the leader picks requests that a
//! quorum of peers have reported as ready, keeping the set of peers that saw
//! *every* chosen request at quorum size, so that a quorum can execute the
//! batch without waiting. In common-subset mode every member derives the
//! batch from the agreed proposals by counting mentions.

use concord_types::{Digest, PeerIndex, RequestId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Compact set of committee members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSet {
    bits: Vec<u8>,
    size: usize,
}

impl PeerSet {
    /// Creates an empty set for a committee of `size`.
    pub fn new(size: usize) -> Self {
        Self {
            bits: vec![0u8; size.div_ceil(8)],
            size,
        }
    }

    /// Creates a set containing every member.
    pub fn full(size: usize) -> Self {
        let mut set = Self::new(size);
        for i in 0..size {
            set.bits[i / 8] |= 1 << (i % 8);
        }
        set
    }

    /// Adds `peer`; returns true if it was not present. Out-of-range peers
    /// are ignored.
    pub fn insert(&mut self, peer: PeerIndex) -> bool {
        let index = usize::from(peer);
        if index >= self.size {
            return false;
        }
        let (byte, bit) = (index / 8, index % 8);
        let fresh = self.bits[byte] & (1 << bit) == 0;
        self.bits[byte] |= 1 << bit;
        fresh
    }

    /// Returns true if `peer` is a member.
    pub fn contains(&self, peer: PeerIndex) -> bool {
        let index = usize::from(peer);
        index < self.size && (self.bits[index / 8] >> (index % 8)) & 1 == 1
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true if no member is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Intersection of two sets over the same committee.
    pub fn and(&self, other: &PeerSet) -> PeerSet {
        PeerSet {
            bits: self
                .bits
                .iter()
                .zip(&other.bits)
                .map(|(a, b)| a & b)
                .collect(),
            size: self.size.min(other.size),
        }
    }

    /// Iterates over member indices.
    pub fn iter(&self) -> impl Iterator<Item = PeerIndex> + '_ {
        (0..self.size)
            .filter_map(|i| PeerIndex::try_from(i).ok())
            .filter(|&p| self.contains(p))
    }
}

#[derive(Debug, Clone)]
struct Support {
    peers: PeerSet,
    arrival: u64,
}

/// Per-request "seen" notifications collected during a round.
///
/// A request's arrival order is fixed by the first notification received for
/// it. The table only grows; it is dropped together with the round.
#[derive(Debug, Clone)]
pub struct Notifications {
    size: usize,
    entries: HashMap<RequestId, Support>,
    next_arrival: u64,
}

impl Notifications {
    /// Creates an empty table for a committee of `size`.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            entries: HashMap::new(),
            next_arrival: 0,
        }
    }

    /// Records that `peer` has `requests` ready. Returns how many
    /// (request, peer) pairs were new.
    pub fn record(&mut self, peer: PeerIndex, requests: &[RequestId]) -> usize {
        let mut fresh = 0;
        for id in requests {
            let entry = self.entries.entry(*id).or_insert_with(|| {
                let arrival = self.next_arrival;
                self.next_arrival += 1;
                Support {
                    peers: PeerSet::new(self.size),
                    arrival,
                }
            });
            if entry.peers.insert(peer) {
                fresh += 1;
            }
        }
        fresh
    }

    /// Number of peers that reported `id`.
    pub fn support(&self, id: &RequestId) -> usize {
        self.entries.get(id).map_or(0, |s| s.peers.len())
    }

    /// Peers that reported `id`.
    pub fn supporters(&self, id: &RequestId) -> Option<&PeerSet> {
        self.entries.get(id).map(|s| &s.peers)
    }

    /// Number of distinct requests seen.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Leader-mode selection over the notification table.
///
/// Candidates are the `ready` requests reported by at least `quorum` peers,
/// ranked by support (descending) then arrival (ascending).
pub fn select_by_notifications(
    notifications: &Notifications,
    ready: &[RequestId],
    quorum: usize,
) -> Vec<RequestId> {
    let mut candidates: Vec<(&RequestId, &Support)> = ready
        .iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter_map(|id| notifications.entries.get(id).map(|s| (id, s)))
        .filter(|(_, s)| s.peers.len() >= quorum)
        .collect();
    candidates.sort_by_key(|(_, s)| (Reverse(s.peers.len()), s.arrival));

    let ranked: Vec<(RequestId, &PeerSet)> =
        candidates.into_iter().map(|(id, s)| (*id, &s.peers)).collect();
    select_ranked(&ranked, quorum)
}

/// Greedy prefix over an already ranked candidate list.
///
/// Takes candidates in order while the intersection of their supporters
/// stays at or above `quorum`; stops at the first one that would break it.
pub fn select_ranked(ranked: &[(RequestId, &PeerSet)], quorum: usize) -> Vec<RequestId> {
    let mut selected = Vec::new();
    let mut common: Option<PeerSet> = None;
    for (id, supporters) in ranked {
        let next = match &common {
            Some(acc) => acc.and(supporters),
            None => (*supporters).clone(),
        };
        if next.len() < quorum {
            break;
        }
        common = Some(next);
        selected.push(*id);
    }
    selected
}

/// Common-subset selection: every request mentioned by more than a third
/// of `size` proposals, in request-id order.
///
/// Each proposal counts at most once per request.
pub fn select_by_mentions<'a, I>(proposals: I, size: usize) -> Vec<RequestId>
where
    I: IntoIterator<Item = &'a [RequestId]>,
{
    let threshold = mention_threshold(size);
    let mut mentions: BTreeMap<RequestId, usize> = BTreeMap::new();
    for requests in proposals {
        let unique: BTreeSet<&RequestId> = requests.iter().collect();
        for id in unique {
            *mentions.entry(*id).or_default() += 1;
        }
    }
    mentions
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(id, _)| id)
        .collect()
}

/// Smallest mention count strictly above `size / 3`.
pub(crate) fn mention_threshold(size: usize) -> usize {
    size / 3 + 1
}

/// Content hash of an ordered batch.
pub fn batch_hash(requests: &[RequestId]) -> Digest {
    let mut parts: Vec<&[u8]> = Vec::with_capacity(requests.len() + 1);
    parts.push(b"batch:");
    parts.extend(requests.iter().map(|id| id.as_bytes().as_slice()));
    Digest::hash_parts(&parts)
}

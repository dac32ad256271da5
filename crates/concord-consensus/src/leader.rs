//! Leader scheduling.
//!
//! Each round derives a permutation of the committee from the baseline's
//! ledger anchor. Every honest member computes the same permutation, so the
//! same peer is considered leader everywhere without any message exchange.
//! Rotation walks the permutation, skipping peers the transport reports as
//! dead.

use concord_types::{Digest, PeerIndex};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Deterministic leader order for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderScheduler {
    order: Vec<PeerIndex>,
    position: usize,
}

impl LeaderScheduler {
    /// Creates a scheduler over `size` members seeded from `anchor`.
    pub fn new(size: u16, anchor: &[u8]) -> Self {
        let mut scheduler = Self {
            order: (0..size.max(1)).collect(),
            position: 0,
        };
        scheduler.reseed(anchor);
        scheduler
    }

    /// Re-shuffles the order from `anchor` and resets to its head.
    pub fn reseed(&mut self, anchor: &[u8]) {
        let seed = Digest::hash(anchor);
        let mut rng = ChaCha8Rng::from_seed(*seed.as_bytes());
        self.order.sort_unstable();
        self.order.shuffle(&mut rng);
        self.position = 0;
    }

    /// The current leader.
    pub fn current(&self) -> PeerIndex {
        self.order[self.position]
    }

    /// Advances to the next live member and returns it.
    ///
    /// When every member is reported dead the scheduler still advances by
    /// one so the next deadline tries someone else.
    pub fn rotate(&mut self, is_alive: impl Fn(PeerIndex) -> bool) -> PeerIndex {
        let len = self.order.len();
        for step in 1..=len {
            let candidate = (self.position + step) % len;
            if is_alive(self.order[candidate]) {
                self.position = candidate;
                return self.current();
            }
        }
        self.position = (self.position + 1) % len;
        self.current()
    }

    /// The full permutation.
    pub fn order(&self) -> &[PeerIndex] {
        &self.order
    }
}

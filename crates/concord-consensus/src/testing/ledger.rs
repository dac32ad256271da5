//! In-memory ledger.

use crate::collaborators::{InclusionState, KeyShare, LedgerClient};
use crate::testing::MockKeyShare;
use crate::transition::StateTransition;
use concord_types::{Baseline, LedgerAnchor, TransactionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug)]
struct Entry {
    transition: StateTransition,
    polls: u32,
    state: InclusionState,
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: HashMap<TransactionId, Entry>,
    confirmed: Vec<StateTransition>,
}

/// A ledger that confirms a valid transaction after a fixed number of polls.
///
/// Posts are deduplicated by transaction id. Transactions whose signature
/// does not verify are rejected, and a rejection can be forced for the next
/// post.
#[derive(Debug)]
pub struct MemoryLedger {
    keys: MockKeyShare,
    confirm_after: u32,
    reject_next: AtomicBool,
    posts: AtomicUsize,
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    /// Creates a ledger verifying with `keys`.
    pub fn new(keys: MockKeyShare, confirm_after: u32) -> Self {
        Self {
            keys,
            confirm_after: confirm_after.max(1),
            reject_next: AtomicBool::new(false),
            posts: AtomicUsize::new(0),
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Rejects the next new transaction.
    pub fn reject_next(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    /// Total post calls, duplicates included.
    pub fn posts(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }

    /// Distinct transactions posted.
    pub fn transactions(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Inclusion state of `id`, if it was posted.
    pub fn state_of(&self, id: &TransactionId) -> Option<InclusionState> {
        self.state.lock().entries.get(id).map(|e| e.state)
    }

    /// Confirmed transitions in confirmation order.
    pub fn confirmed(&self) -> Vec<StateTransition> {
        self.state.lock().confirmed.clone()
    }

    /// The baseline a confirmed transition establishes.
    pub fn baseline_for(transition: &StateTransition) -> Baseline {
        Baseline::new(
            transition.state.state_index,
            transition.state.commitment,
            LedgerAnchor::from_bytes(transition.id().as_bytes().to_vec()),
            transition.timestamp,
        )
    }
}

impl LedgerClient for MemoryLedger {
    fn post_transaction(&self, transition: &StateTransition) {
        self.posts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let id = transition.id();
        if state.entries.contains_key(&id) {
            return;
        }
        let signed = transition
            .signature
            .as_ref()
            .is_some_and(|sig| self.keys.verify_full(transition.signed_digest().as_bytes(), sig));
        let inclusion = if !signed || self.reject_next.swap(false, Ordering::SeqCst) {
            InclusionState::Rejected
        } else {
            InclusionState::Pending
        };
        state.entries.insert(
            id,
            Entry {
                transition: transition.clone(),
                polls: 0,
                state: inclusion,
            },
        );
    }

    fn poll_inclusion_state(&self, id: &TransactionId) -> InclusionState {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.entries.get_mut(id) else {
            return InclusionState::Pending;
        };
        if entry.state == InclusionState::Pending {
            entry.polls += 1;
            if entry.polls >= self.confirm_after {
                entry.state = InclusionState::Confirmed;
                state.confirmed.push(entry.transition.clone());
                return InclusionState::Confirmed;
            }
        }
        entry.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::{ResultEssence, ResultState};
    use concord_types::{BaselineId, Digest, RequestId, StateIndex, Timestamp};

    const GROUP: &[u8] = b"ledger-test";

    fn signed_transition() -> StateTransition {
        let mut transition = StateTransition::new(
            BaselineId::new(Digest::hash(b"baseline")),
            ResultState {
                state_index: StateIndex(1),
                commitment: Digest::hash(b"state"),
            },
            ResultEssence(b"essence".to_vec()).digest(),
            vec![RequestId::derive(b"r")],
            Timestamp::from_millis(1),
        );
        let message = transition.signed_digest();
        let shares: Vec<_> = (0..3)
            .map(|peer| {
                (
                    peer,
                    MockKeyShare::new(GROUP, 4, peer).sign_share(message.as_bytes()),
                )
            })
            .collect();
        let keys = MockKeyShare::new(GROUP, 4, 0);
        transition.signature = Some(
            keys.recover_full_signature(&shares, message.as_bytes())
                .unwrap(),
        );
        transition
    }

    #[test]
    fn test_confirms_after_polls_and_dedupes() {
        let ledger = MemoryLedger::new(MockKeyShare::new(GROUP, 4, 0), 2);
        let transition = signed_transition();
        ledger.post_transaction(&transition);
        ledger.post_transaction(&transition);

        assert_eq!(ledger.posts(), 2);
        assert_eq!(ledger.transactions(), 1);
        let id = transition.id();
        assert_eq!(ledger.poll_inclusion_state(&id), InclusionState::Pending);
        assert_eq!(ledger.poll_inclusion_state(&id), InclusionState::Confirmed);
        assert_eq!(ledger.confirmed(), vec![transition]);
    }

    #[test]
    fn test_rejects_signature_moved_to_other_content() {
        let ledger = MemoryLedger::new(MockKeyShare::new(GROUP, 4, 0), 1);
        let mut forged = signed_transition();
        forged.state.commitment = Digest::hash(b"forged");
        forged.requests.push(RequestId::derive(b"extra"));

        ledger.post_transaction(&forged);
        assert_eq!(ledger.state_of(&forged.id()), Some(InclusionState::Rejected));
        assert!(ledger.confirmed().is_empty());
    }
}

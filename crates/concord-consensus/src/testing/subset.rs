//! Trusted common-subset agreement for local committees.

use crate::collaborators::{CommonSubset, SubsetDecision};
use crate::proposal::BatchProposal;
use concord_types::{quorum, BaselineId, PeerIndex};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

#[derive(Debug, Default)]
struct Instances {
    proposals: HashMap<(BaselineId, u32), BTreeMap<PeerIndex, BatchProposal>>,
    decided: HashSet<(BaselineId, u32)>,
    decisions: VecDeque<SubsetDecision>,
}

/// Decides an instance as soon as a quorum of distinct members proposed.
///
/// The decision holds those proposals ordered by proposer and is delivered
/// once, through [`LocalSubset::drain_decisions`]. Proposals arriving after
/// the decision are ignored.
#[derive(Debug)]
pub struct LocalSubset {
    quorum: usize,
    inner: Mutex<Instances>,
}

impl LocalSubset {
    /// Creates agreement for a committee of `size`.
    pub fn new(size: u16) -> Self {
        Self {
            quorum: quorum::quorum(usize::from(size)),
            inner: Mutex::new(Instances::default()),
        }
    }

    /// Decisions reached since the last call.
    pub fn drain_decisions(&self) -> Vec<SubsetDecision> {
        self.inner.lock().decisions.drain(..).collect()
    }

    /// Number of instances decided so far.
    pub fn decided(&self) -> usize {
        self.inner.lock().decided.len()
    }
}

impl CommonSubset for LocalSubset {
    fn propose(&self, proposal: BatchProposal) {
        let mut inner = self.inner.lock();
        let key = (proposal.baseline_id, proposal.attempt);
        if inner.decided.contains(&key) {
            return;
        }
        let proposals = inner.proposals.entry(key).or_default();
        proposals.entry(proposal.proposer).or_insert(proposal);
        if proposals.len() < self.quorum {
            return;
        }
        let agreed: Vec<BatchProposal> = proposals.values().cloned().collect();
        inner.proposals.remove(&key);
        inner.decided.insert(key);
        inner.decisions.push_back(SubsetDecision {
            baseline_id: key.0,
            attempt: key.1,
            proposals: agreed,
        });
    }
}

//! Per-round state.
//!
//! A [`Round`] is created for every confirmed baseline and dropped the
//! moment a newer one arrives. It is owned and mutated only by the engine
//! step, so nothing in here is synchronized.

use crate::aggregator::ResultAggregator;
use crate::batch::Notifications;
use crate::collaborators::{ExecutionInput, InclusionState};
use crate::config::AgreementMode;
use crate::leader::LeaderScheduler;
use crate::message::StartProcessing;
use crate::params::AgreedRound;
use crate::proposal::BatchProposal;
use crate::stage::Stage;
use crate::transition::StateTransition;
use concord_types::{
    quorum, Baseline, BaselineId, Digest, PeerIndex, SignatureShare, StateIndex, TransactionId,
};
use std::time::Duration;
use tokio::time::Instant;

/// A leader's instruction accepted by a subordinate.
#[derive(Debug, Clone)]
pub(crate) struct Instruction {
    pub from: PeerIndex,
    pub start: StartProcessing,
}

/// The execution dispatched for this round.
#[derive(Debug, Clone)]
pub(crate) struct PendingExecution {
    pub attempt: u64,
    pub batch_hash: Digest,
    pub input: ExecutionInput,
    pub in_flight: bool,
}

/// A subordinate's own signed result.
#[derive(Debug, Clone)]
pub(crate) struct OwnResult {
    pub transition: StateTransition,
    pub share: SignatureShare,
}

/// A finalized transition being tracked on the ledger.
#[derive(Debug, Clone)]
pub(crate) struct Posted {
    pub id: TransactionId,
    pub next_poll: Instant,
    pub inclusion: InclusionState,
}

/// State of one consensus round.
#[derive(Debug)]
pub struct Round {
    pub(crate) baseline: Baseline,
    pub(crate) baseline_id: BaselineId,
    pub(crate) size: usize,
    pub(crate) started: Instant,
    pub(crate) stage: Stage,
    pub(crate) stage_entered: Instant,
    pub(crate) mode: AgreementMode,
    pub(crate) scheduler: LeaderScheduler,
    pub(crate) rotations: u32,
    /// Rotations taken while this member had ready requests.
    pub(crate) busy_rotations: u32,
    pub(crate) rotation_suppressed: bool,
    pub(crate) notifications: Notifications,
    pub(crate) notified: Option<(PeerIndex, Digest)>,
    pub(crate) last_sent: Option<Instant>,
    pub(crate) leader_start: Option<StartProcessing>,
    pub(crate) instruction: Option<Instruction>,
    pub(crate) execution: Option<PendingExecution>,
    pub(crate) aggregator: Option<ResultAggregator>,
    pub(crate) own_result: Option<OwnResult>,
    pub(crate) proposal: Option<BatchProposal>,
    pub(crate) proposal_attempt: u32,
    pub(crate) decided: bool,
    pub(crate) agreed: Option<AgreedRound>,
    pub(crate) finalized: Option<StateTransition>,
    pub(crate) posted: Option<Posted>,
}

impl Round {
    /// Creates a round on `baseline` for a committee of `size`.
    pub fn new(baseline: Baseline, size: u16, mode: AgreementMode, now: Instant) -> Self {
        let scheduler = LeaderScheduler::new(size, &baseline.anchor.bytes);
        let size = usize::from(size);
        let mut round = Self {
            baseline_id: baseline.id(),
            baseline,
            size,
            started: now,
            stage: Stage::Idle,
            stage_entered: now,
            mode: AgreementMode::Leader,
            scheduler,
            rotations: 0,
            busy_rotations: 0,
            rotation_suppressed: false,
            notifications: Notifications::new(size),
            notified: None,
            last_sent: None,
            leader_start: None,
            instruction: None,
            execution: None,
            aggregator: None,
            own_result: None,
            proposal: None,
            proposal_attempt: 0,
            decided: false,
            agreed: None,
            finalized: None,
            posted: None,
        };
        if mode == AgreementMode::CommonSubset {
            round.enter_subset_mode();
        }
        round
    }

    /// The baseline this round builds on.
    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    /// Identifier of the baseline.
    pub fn baseline_id(&self) -> &BaselineId {
        &self.baseline_id
    }

    /// Index of the state this round produces.
    pub fn target_index(&self) -> StateIndex {
        self.baseline.target_index()
    }

    /// Active stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Agreement mode.
    pub fn mode(&self) -> AgreementMode {
        self.mode
    }

    /// Rotations performed so far.
    pub fn rotations(&self) -> u32 {
        self.rotations
    }

    /// The current leader.
    pub fn leader(&self) -> PeerIndex {
        self.scheduler.current()
    }

    /// The finalized transition, once this member finalized or observed it.
    pub fn finalized(&self) -> Option<&StateTransition> {
        self.finalized.as_ref()
    }

    /// Accepted signed results held by the aggregator.
    pub fn signed_results(&self) -> usize {
        self.aggregator.as_ref().map_or(0, ResultAggregator::accepted)
    }

    pub(crate) fn quorum(&self) -> usize {
        quorum::quorum(self.size)
    }

    /// Moves forward along the current path.
    pub(crate) fn advance(&mut self, next: Stage, now: Instant) {
        debug_assert!(
            self.stage.precedes(next),
            "illegal stage transition {} -> {}",
            self.stage,
            next
        );
        self.stage = next;
        self.stage_entered = now;
    }

    pub(crate) fn deadline_elapsed(&self, now: Instant, timeout: Duration) -> bool {
        self.stage.has_deadline() && now.saturating_duration_since(self.stage_entered) >= timeout
    }

    /// Returns to `Idle`, dropping everything tied to the abandoned path.
    ///
    /// Notifications survive: they describe peers' pools, not a leader.
    pub(crate) fn restart(&mut self, now: Instant) {
        self.stage = Stage::Idle;
        self.stage_entered = now;
        self.rotation_suppressed = false;
        self.notified = None;
        self.last_sent = None;
        self.leader_start = None;
        self.instruction = None;
        self.execution = None;
        self.own_result = None;
        if self.mode == AgreementMode::Leader {
            self.aggregator = None;
        }
    }

    /// Switches to common-subset agreement for the rest of the round.
    pub(crate) fn enter_subset_mode(&mut self) {
        self.mode = AgreementMode::CommonSubset;
        self.aggregator = Some(ResultAggregator::new(self.size, self.quorum()));
    }

    /// Marks the round as finished with `transition`, moving to the terminal
    /// stage of the current path.
    pub(crate) fn finish(
        &mut self,
        transition: StateTransition,
        poll_period: Duration,
        now: Instant,
    ) {
        let terminal = match self.stage.path() {
            crate::stage::Path::Leader => Stage::LeaderFinalized,
            crate::stage::Path::Subset => Stage::SubsetFinalized,
            crate::stage::Path::Subordinate | crate::stage::Path::Idle => Stage::SubFinalized,
        };
        self.posted = Some(Posted {
            id: transition.id(),
            next_poll: now + poll_period,
            inclusion: InclusionState::Pending,
        });
        self.finalized = Some(transition);
        self.execution = None;
        if !self.stage.is_finalized() {
            self.advance(terminal, now);
        }
    }
}

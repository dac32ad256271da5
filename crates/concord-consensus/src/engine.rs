//! The consensus engine.
//!
//! [`ConsensusEngine`] is a synchronous state machine. Every input is an
//! [`Event`]; [`ConsensusEngine::step`] applies it to the current round, runs
//! one reconciliation pass and returns the executions that must be started.
//! Nothing in here blocks or spawns: the async runner in
//! [`runner`](crate::runner) and the simulation harness both drive the same
//! step function.

use crate::aggregator::{Contribution, ResultAggregator};
use crate::batch::{batch_hash, select_by_notifications};
use crate::collaborators::{
    Collaborators, ExecutionEngine, ExecutionInput, ExecutionOutput, InclusionState,
    SubsetDecision,
};
use crate::config::{AgreementMode, EngineConfig};
use crate::error::{ConsensusError, Result};
use crate::message::{
    MessageKind, NotifyRequests, PeerMessage, ResultPosted, SignedResult, StartProcessing,
};
use crate::metrics::ConsensusMetrics;
use crate::params::{agree_on_subset, leader_parameters, RoundParameters};
use crate::proposal::{BatchProposal, ProposalHints};
use crate::round::{Instruction, OwnResult, PendingExecution, Round};
use crate::stage::Stage;
use crate::status::{PendingCounts, RequestTracker, StatusCell, StatusSnapshot};
use crate::transition::StateTransition;
use bytes::Bytes;
use concord_types::{
    Baseline, BaselineId, CommitteeView, Digest, PeerIdentity, PeerIndex, Request, RequestId,
    SignatureShare, Timestamp,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Source of wall-clock time for round timestamps.
pub type WallClock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Inputs to the state machine.
#[derive(Debug)]
pub enum Event {
    /// A newly confirmed baseline.
    NewBaseline(Baseline),
    /// A payload received from a peer.
    PeerMessage {
        /// Committee index of the sender.
        sender: PeerIndex,
        /// Kind carried by the transport.
        kind: MessageKind,
        /// Encoded payload.
        payload: Bytes,
    },
    /// A dispatched execution finished.
    ExecutionComplete(ExecutionCompletion),
    /// Common-subset agreement delivered its decision.
    SubsetAgreed(SubsetDecision),
    /// Periodic re-evaluation.
    TimerTick,
}

impl Event {
    /// Returns the event type as a string for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Event::NewBaseline(_) => "new_baseline",
            Event::PeerMessage { .. } => "peer_message",
            Event::ExecutionComplete(_) => "execution_complete",
            Event::SubsetAgreed(_) => "subset_agreed",
            Event::TimerTick => "timer_tick",
        }
    }
}

/// An execution the driver must run.
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    /// Dispatch attempt; results for older attempts are ignored.
    pub attempt: u64,
    /// Baseline of the dispatching round.
    pub baseline_id: BaselineId,
    /// Execution input.
    pub input: ExecutionInput,
}

impl ExecutionTask {
    /// Wraps an execution result as a completion event payload.
    pub fn complete(self, result: Result<ExecutionOutput>) -> ExecutionCompletion {
        ExecutionCompletion {
            attempt: self.attempt,
            baseline_id: self.baseline_id,
            request_ids: self.input.request_ids(),
            result,
        }
    }

    /// Runs the task on `engine`.
    pub async fn run(self, engine: &dyn ExecutionEngine) -> ExecutionCompletion {
        let result = engine.execute(self.input.clone()).await;
        self.complete(result)
    }
}

/// Result of an [`ExecutionTask`].
#[derive(Debug)]
pub struct ExecutionCompletion {
    /// Attempt of the originating task.
    pub attempt: u64,
    /// Baseline of the originating round.
    pub baseline_id: BaselineId,
    /// Executed batch, in order.
    pub request_ids: Vec<RequestId>,
    /// Execution outcome.
    pub result: Result<ExecutionOutput>,
}

/// Everything the step needs besides the round itself.
struct Context {
    config: EngineConfig,
    committee: CommitteeView,
    identity: PeerIdentity,
    collab: Collaborators,
    metrics: Arc<ConsensusMetrics>,
    tracker: Arc<RequestTracker>,
    clock: WallClock,
    next_attempt: u64,
    last_ready: usize,
    tasks: Vec<ExecutionTask>,
}

/// One committee member's consensus state machine for one chain.
pub struct ConsensusEngine {
    ctx: Context,
    round: Option<Round>,
    status: Arc<StatusCell>,
}

impl std::fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusEngine")
            .field("node", &self.ctx.own())
            .field("round", &self.round.as_ref().map(Round::target_index))
            .field("stage", &self.round.as_ref().map(Round::stage))
            .finish()
    }
}

impl ConsensusEngine {
    /// Creates an engine for the member `committee.own_index()`.
    pub fn new(
        config: EngineConfig,
        committee: CommitteeView,
        identity: PeerIdentity,
        collab: Collaborators,
    ) -> Result<Self> {
        let own = committee.own_index();
        if committee.identity(own) != Some(&identity.public_key()) {
            return Err(ConsensusError::IdentityMismatch { index: own });
        }
        Ok(Self {
            status: Arc::new(StatusCell::new(own)),
            ctx: Context {
                config,
                committee,
                identity,
                collab,
                metrics: Arc::new(ConsensusMetrics::new()),
                tracker: Arc::new(RequestTracker::new()),
                clock: Arc::new(Timestamp::now),
                next_attempt: 0,
                last_ready: 0,
                tasks: Vec::new(),
            },
            round: None,
        })
    }

    /// Records into shared metrics instead of private ones.
    pub fn with_metrics(mut self, metrics: Arc<ConsensusMetrics>) -> Self {
        self.ctx.metrics = metrics;
        self
    }

    /// Uses `clock` for round timestamps.
    pub fn with_wall_clock(mut self, clock: impl Fn() -> Timestamp + Send + Sync + 'static) -> Self {
        self.ctx.clock = Arc::new(clock);
        self
    }

    /// This member's committee index.
    pub fn own_index(&self) -> PeerIndex {
        self.ctx.own()
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// The current round.
    pub fn round(&self) -> Option<&Round> {
        self.round.as_ref()
    }

    /// Latest published status.
    pub fn status(&self) -> Arc<StatusSnapshot> {
        self.status.load()
    }

    /// Shared handle to the published status.
    pub fn status_cell(&self) -> Arc<StatusCell> {
        Arc::clone(&self.status)
    }

    /// Shared handle to the in-flight request bookkeeping.
    pub fn tracker(&self) -> Arc<RequestTracker> {
        Arc::clone(&self.ctx.tracker)
    }

    /// Applies one event, reconciles the round and returns new executions.
    pub fn step(&mut self, event: Event, now: Instant) -> Vec<ExecutionTask> {
        trace!(node = self.ctx.own(), event = event.name(), "Engine step");
        match event {
            Event::NewBaseline(baseline) => self.on_new_baseline(baseline, now),
            Event::PeerMessage {
                sender,
                kind,
                payload,
            } => {
                if let Some(message) = self.ctx.decode(sender, kind, &payload) {
                    match self.round.as_mut() {
                        Some(round) => self.ctx.on_peer_message(round, sender, message, now),
                        None => self.ctx.dropped(kind.as_str(), "no_round"),
                    }
                }
            }
            Event::ExecutionComplete(completion) => {
                if let Some(round) = self.round.as_mut() {
                    self.ctx.on_execution_complete(round, completion, now);
                }
            }
            Event::SubsetAgreed(decision) => {
                if let Some(round) = self.round.as_mut() {
                    self.ctx.on_subset_agreed(round, decision);
                }
            }
            Event::TimerTick => {}
        }

        if let Some(round) = self.round.as_mut() {
            self.ctx.take_action(round, now);
        }
        self.status.publish(self.ctx.snapshot(self.round.as_ref()));
        std::mem::take(&mut self.ctx.tasks)
    }

    fn on_new_baseline(&mut self, baseline: Baseline, now: Instant) {
        let node = self.ctx.own();
        if let Some(current) = &self.round {
            if !current.baseline().is_superseded_by(&baseline) {
                debug!(
                    node,
                    current = %current.baseline().state_index,
                    offered = %baseline.state_index,
                    "Ignoring baseline that is not newer"
                );
                return;
            }
            if !current.stage().is_finalized() {
                info!(
                    node,
                    round = %current.target_index(),
                    stage = %current.stage(),
                    "Round abandoned"
                );
                self.ctx
                    .metrics
                    .rounds_abandoned
                    .get_or_create(&ConsensusMetrics::node(node))
                    .inc();
            }
        }

        let size = self.ctx.committee.size() as u16;
        let round = Round::new(baseline, size, self.ctx.config.initial_mode, now);
        info!(
            node,
            round = %round.target_index(),
            baseline = %round.baseline_id(),
            leader = round.leader(),
            mode = round.mode().as_str(),
            "Round started"
        );
        let labels = ConsensusMetrics::node(node);
        self.ctx.metrics.rounds_started.get_or_create(&labels).inc();
        self.ctx
            .metrics
            .baseline_index
            .get_or_create(&labels)
            .set(round.baseline().state_index.0 as i64);
        self.ctx.tracker.clear();
        self.round = Some(round);
    }
}

impl Context {
    fn own(&self) -> PeerIndex {
        self.committee.own_index()
    }

    fn dropped(&self, kind: &str, reason: &str) {
        self.metrics.dropped(self.own(), kind, reason);
    }

    fn send(&self, peer: PeerIndex, message: &PeerMessage) {
        match message.encode() {
            Ok(payload) => self.collab.transport.send_to(peer, message.kind(), payload),
            Err(e) => error!(node = self.own(), kind = %message.kind(), error = %e, "Failed to encode message"),
        }
    }

    fn broadcast(&self, message: &PeerMessage) {
        match message.encode() {
            Ok(payload) => {
                self.collab
                    .transport
                    .broadcast(message.kind(), payload, (self.clock)())
            }
            Err(e) => error!(node = self.own(), kind = %message.kind(), error = %e, "Failed to encode message"),
        }
    }

    fn decode(&self, sender: PeerIndex, kind: MessageKind, payload: &[u8]) -> Option<PeerMessage> {
        if !self.committee.contains(sender) || sender == self.own() {
            warn!(node = self.own(), sender, kind = %kind, "Message from invalid sender");
            self.dropped(kind.as_str(), "invalid_sender");
            return None;
        }
        match PeerMessage::decode(kind, payload) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(node = self.own(), sender, error = %e, "Dropping malformed message");
                self.dropped(kind.as_str(), "malformed");
                None
            }
        }
    }

    // ----------------------------------------------------------------------
    // Peer messages
    // ----------------------------------------------------------------------

    fn on_peer_message(&mut self, round: &mut Round, sender: PeerIndex, message: PeerMessage, now: Instant) {
        let kind = message.kind();
        if message.baseline_id() != round.baseline_id() {
            debug!(
                node = self.own(),
                sender,
                kind = %kind,
                theirs = %message.baseline_id(),
                "Dropping message for another baseline"
            );
            self.dropped(kind.as_str(), "stale");
            return;
        }
        match message {
            PeerMessage::NotifyRequests(m) => self.on_notify(round, sender, m),
            PeerMessage::StartProcessing(m) => self.on_start(round, sender, m),
            PeerMessage::SignedResult(m) => self.on_signed_result(round, sender, m),
            PeerMessage::ResultPosted(m) => self.on_result_posted(round, sender, m, now),
        }
    }

    fn on_notify(&mut self, round: &mut Round, sender: PeerIndex, message: NotifyRequests) {
        let fresh = round.notifications.record(sender, &message.request_ids);
        for id in &message.request_ids {
            self.collab.pool.mark_seen(id, sender);
        }
        debug!(
            node = self.own(),
            sender,
            requests = message.request_ids.len(),
            fresh,
            "Notification recorded"
        );
    }

    fn on_start(&mut self, round: &mut Round, sender: PeerIndex, message: StartProcessing) {
        let kind = MessageKind::StartProcessing.as_str();
        let reason = if round.mode() != AgreementMode::Leader {
            Some("not_leader_mode")
        } else if sender != round.leader() {
            Some("not_current_leader")
        } else if !message.is_consistent() {
            Some("batch_hash_mismatch")
        } else if message.request_ids.iter().collect::<BTreeSet<_>>().len()
            != message.request_ids.len()
        {
            Some("duplicate_request")
        } else if round.instruction.is_some()
            || !matches!(round.stage(), Stage::SubStart | Stage::SubNotified)
        {
            Some("duplicate")
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!(node = self.own(), sender, reason, "Ignoring start instruction");
            self.dropped(kind, reason);
            if reason == "duplicate" {
                self.resend_own_result(round, sender, &message);
            }
            return;
        }
        info!(
            node = self.own(),
            leader = sender,
            batch = message.request_ids.len(),
            "Start instruction received"
        );
        round.instruction = Some(Instruction {
            from: sender,
            start: message,
        });
    }

    /// Answers a repeated instruction from the leader with the share it may
    /// have missed.
    fn resend_own_result(&self, round: &Round, leader: PeerIndex, message: &StartProcessing) {
        if round.stage() != Stage::SubCalculated {
            return;
        }
        let same_batch = round
            .instruction
            .as_ref()
            .is_some_and(|i| i.from == leader && i.start.batch_hash == message.batch_hash);
        let Some(own) = round.own_result.as_ref().filter(|_| same_batch) else {
            return;
        };
        debug!(node = self.own(), leader, "Re-sending signed result");
        self.send(
            leader,
            &PeerMessage::SignedResult(SignedResult {
                baseline_id: *round.baseline_id(),
                digest: own.transition.signed_digest(),
                share: own.share.clone(),
            }),
        );
    }

    fn on_signed_result(&mut self, round: &mut Round, sender: PeerIndex, message: SignedResult) {
        let kind = MessageKind::SignedResult.as_str();
        let Some(aggregator) = round.aggregator.as_mut() else {
            debug!(node = self.own(), sender, "Signed result while not aggregating");
            self.dropped(kind, "not_aggregating");
            return;
        };
        let outcome = aggregator.add(
            sender,
            message.digest,
            message.share,
            self.collab.keys.as_ref(),
        );
        match outcome {
            Contribution::Accepted | Contribution::Buffered => {}
            other => self.dropped(kind, other.as_str()),
        }
    }

    fn on_result_posted(&mut self, round: &mut Round, sender: PeerIndex, message: ResultPosted, now: Instant) {
        let kind = MessageKind::ResultPosted.as_str();
        if round.finalized.is_some() {
            self.dropped(kind, "already_finalized");
            return;
        }
        let transition = message.transition;
        let verified = transition.baseline_id == *round.baseline_id()
            && transition
                .signature
                .as_ref()
                .is_some_and(|sig| {
                    self.collab
                        .keys
                        .verify_full(transition.signed_digest().as_bytes(), sig)
                });
        if !verified {
            warn!(node = self.own(), sender, "Posted transition does not verify");
            self.dropped(kind, "invalid_signature");
            return;
        }
        if let Some(own) = &round.own_result {
            if own.transition.id() != transition.id() {
                warn!(
                    node = self.own(),
                    sender,
                    ours = %own.transition.id(),
                    posted = %transition.id(),
                    "Posted transition differs from local result"
                );
                self.dropped(kind, "result_mismatch");
                return;
            }
        }
        info!(
            node = self.own(),
            sender,
            round = %round.target_index(),
            tx = %transition.id(),
            "Finalized transition observed"
        );
        self.finish(round, transition, now);
    }

    // ----------------------------------------------------------------------
    // Execution
    // ----------------------------------------------------------------------

    fn on_execution_complete(&mut self, round: &mut Round, completion: ExecutionCompletion, now: Instant) {
        let node = self.own();
        let Some(execution) = round.execution.as_ref() else {
            debug!(node, attempt = completion.attempt, "Execution result without pending execution");
            return;
        };
        if completion.attempt != execution.attempt || completion.baseline_id != *round.baseline_id() {
            debug!(node, attempt = completion.attempt, "Discarding stale execution result");
            return;
        }
        let recorded = execution.batch_hash;
        let timestamp = execution.input.timestamp;
        let recomputed = batch_hash(&completion.request_ids);
        if recomputed != recorded {
            panic!(
                "batch hash mismatch for round {}: recorded {recorded}, recomputed {recomputed}",
                round.target_index()
            );
        }

        let output = match completion.result {
            Ok(output) => output,
            Err(e) => {
                warn!(node, attempt = completion.attempt, error = %e, "Execution failed; retrying");
                self.metrics
                    .executions_failed
                    .get_or_create(&ConsensusMetrics::node(node))
                    .inc();
                if let Some(execution) = round.execution.as_mut() {
                    execution.in_flight = false;
                }
                return;
            }
        };
        round.execution = None;

        let transition = StateTransition::new(
            *round.baseline_id(),
            output.state,
            output.essence.digest(),
            completion.request_ids,
            timestamp,
        );
        let digest = transition.signed_digest();
        let share = self.collab.keys.sign_share(digest.as_bytes());
        debug!(node, tx = %digest, stage = %round.stage(), "Execution complete");

        match round.stage() {
            Stage::LeaderCalculating => {
                self.install_own_result(round, transition, share);
                round.advance(Stage::LeaderCalculated, now);
            }
            Stage::SubsetCalculating => {
                self.install_own_result(round, transition, share.clone());
                self.broadcast(&PeerMessage::SignedResult(SignedResult {
                    baseline_id: *round.baseline_id(),
                    digest,
                    share,
                }));
                round.advance(Stage::SubsetCalculated, now);
            }
            Stage::SubCalculating => {
                let Some(leader) = round.instruction.as_ref().map(|i| i.from) else {
                    return;
                };
                self.send(
                    leader,
                    &PeerMessage::SignedResult(SignedResult {
                        baseline_id: *round.baseline_id(),
                        digest,
                        share: share.clone(),
                    }),
                );
                round.own_result = Some(OwnResult { transition, share });
                round.advance(Stage::SubCalculated, now);
            }
            other => debug!(node, stage = %other, "Execution result in unexpected stage"),
        }
    }

    fn install_own_result(&self, round: &mut Round, transition: StateTransition, share: SignatureShare) {
        let own = self.own();
        let Some(aggregator) = round.aggregator.as_mut() else {
            return;
        };
        let outcomes = aggregator.set_own_result(own, transition, share, self.collab.keys.as_ref());
        for (peer, outcome) in outcomes {
            if !matches!(outcome, Contribution::Accepted) {
                debug!(node = own, peer, outcome = outcome.as_str(), "Buffered share rejected");
                self.dropped(MessageKind::SignedResult.as_str(), outcome.as_str());
            }
        }
    }

    fn dispatch(&mut self, round: &mut Round, input: ExecutionInput, hash: Digest) {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        self.tracker.begin(&input.request_ids(), input.timestamp);
        round.execution = Some(PendingExecution {
            attempt,
            batch_hash: hash,
            input: input.clone(),
            in_flight: true,
        });
        debug!(node = self.own(), attempt, batch = input.requests.len(), "Dispatching execution");
        self.tasks.push(ExecutionTask {
            attempt,
            baseline_id: *round.baseline_id(),
            input,
        });
    }

    fn redispatch(&mut self, round: &mut Round) {
        let Some(execution) = round.execution.as_ref() else {
            return;
        };
        if execution.in_flight {
            return;
        }
        let input = execution.input.clone();
        let hash = execution.batch_hash;
        info!(node = self.own(), round = %round.target_index(), "Retrying execution");
        self.dispatch(round, input, hash);
    }

    fn take_in_order(&self, batch: &[RequestId]) -> Option<Vec<Request>> {
        let (found, all_found) = self.collab.pool.take_ready(batch);
        if !all_found {
            return None;
        }
        let mut by_id: HashMap<RequestId, Request> = found.into_iter().map(|r| (r.id, r)).collect();
        batch.iter().map(|id| by_id.remove(id)).collect()
    }

    fn input(&self, round: &Round, requests: Vec<Request>, params: &RoundParameters) -> ExecutionInput {
        ExecutionInput {
            baseline: round.baseline().clone(),
            requests,
            timestamp: params.timestamp,
            entropy: params.entropy,
            fee_target: params.fee_target.clone(),
        }
    }

    // ----------------------------------------------------------------------
    // Common subset
    // ----------------------------------------------------------------------

    fn on_subset_agreed(&mut self, round: &mut Round, decision: SubsetDecision) {
        let node = self.own();
        if round.mode() != AgreementMode::CommonSubset
            || decision.baseline_id != *round.baseline_id()
            || decision.attempt != round.proposal_attempt
        {
            debug!(node, attempt = decision.attempt, "Ignoring stale subset decision");
            return;
        }
        if round.stage() != Stage::SubsetProposed || round.decided {
            debug!(node, "Ignoring repeated subset decision");
            return;
        }
        round.decided = true;
        match agree_on_subset(
            &decision.proposals,
            round.baseline_id(),
            &self.committee,
            self.collab.keys.as_ref(),
        ) {
            Ok(agreed) => {
                info!(
                    node,
                    round = %round.target_index(),
                    batch = agreed.batch.len(),
                    accepted = agreed.accepted.len(),
                    selected = agreed.selected,
                    timestamp = %agreed.params.timestamp,
                    "Common subset agreed"
                );
                round.agreed = Some(agreed);
            }
            Err(e) => {
                warn!(node, round = %round.target_index(), error = %e, "Subset decision unusable");
            }
        }
    }

    fn propose(&mut self, round: &mut Round, now: Instant) {
        let ready = self.collab.pool.ready_requests();
        self.last_ready = ready.len();
        let timestamp = round
            .baseline()
            .timestamp
            .saturating_add_millis(1)
            .max((self.clock)());
        let share = self.collab.keys.sign_share(round.baseline_id().as_bytes());
        let proposal = BatchProposal::new(
            &self.identity,
            self.own(),
            *round.baseline_id(),
            round.proposal_attempt,
            ready,
            ProposalHints {
                timestamp,
                fee_target: self.config.fee_target.clone(),
            },
            share,
        );
        info!(
            node = self.own(),
            round = %round.target_index(),
            attempt = round.proposal_attempt,
            requests = proposal.request_ids.len(),
            "Proposing to common subset"
        );
        self.collab.subset.propose(proposal.clone());
        round.proposal = Some(proposal);
        round.advance(Stage::SubsetProposed, now);
    }

    fn start_agreed(&mut self, round: &mut Round, now: Instant) {
        let Some(agreed) = round.agreed.as_ref() else {
            return;
        };
        if agreed.batch.is_empty() {
            return;
        }
        let Some(requests) = self.take_in_order(&agreed.batch) else {
            debug!(node = self.own(), "Waiting for agreed requests");
            return;
        };
        let params = agreed.params.clone();
        let hash = batch_hash(&agreed.batch);
        let input = self.input(round, requests, &params);
        self.dispatch(round, input, hash);
        round.advance(Stage::SubsetCalculating, now);
    }

    fn subset_deadline(&mut self, round: &mut Round, now: Instant) {
        let node = self.own();
        match round.stage() {
            Stage::SubsetProposed if round.decided => {
                let stuck = round.agreed.as_ref().map_or(true, |a| a.batch.is_empty());
                if stuck {
                    round.proposal_attempt += 1;
                    round.decided = false;
                    round.agreed = None;
                    round.proposal = None;
                    info!(node, attempt = round.proposal_attempt, "Nothing to execute; proposing again");
                    round.restart(now);
                    return;
                }
            }
            Stage::SubsetProposed => {
                if let Some(proposal) = &round.proposal {
                    debug!(node, "Resubmitting proposal");
                    self.collab.subset.propose(proposal.clone());
                }
            }
            Stage::SubsetCalculated => {
                if let Some(aggregator) = &round.aggregator {
                    if let (Some(transition), Some(share)) =
                        (aggregator.transition(), aggregator.own_share(node))
                    {
                        debug!(node, "Re-broadcasting signed result");
                        self.broadcast(&PeerMessage::SignedResult(SignedResult {
                            baseline_id: *round.baseline_id(),
                            digest: transition.signed_digest(),
                            share: share.clone(),
                        }));
                    }
                }
            }
            _ => {}
        }
        round.stage_entered = now;
    }

    // ----------------------------------------------------------------------
    // Reconciliation
    // ----------------------------------------------------------------------

    fn take_action(&mut self, round: &mut Round, now: Instant) {
        let quorum_alive = self.collab.transport.quorum_alive();

        if round.deadline_elapsed(now, self.config.stage_timeout()) {
            match round.mode() {
                AgreementMode::CommonSubset => self.subset_deadline(round, now),
                AgreementMode::Leader if quorum_alive => self.rotate(round, now),
                AgreementMode::Leader => {
                    if !round.rotation_suppressed {
                        warn!(
                            node = self.own(),
                            stage = %round.stage(),
                            "Deadline elapsed without a live quorum; not rotating"
                        );
                        round.rotation_suppressed = true;
                    }
                }
            }
        }

        if round.stage() == Stage::Idle {
            self.enter_path(round, now);
        }
        if matches!(round.stage(), Stage::SubStart | Stage::SubNotified) {
            self.notify_leader(round, now);
        }
        if round.stage() == Stage::SubNotified {
            self.start_instructed(round, now);
        }
        if round.stage() == Stage::LeaderStart && quorum_alive {
            self.lead(round, now);
        }
        if matches!(round.stage(), Stage::LeaderCalculating | Stage::LeaderCalculated) {
            self.resend_start(round, now);
        }
        if round.stage() == Stage::SubsetProposed {
            self.start_agreed(round, now);
        }
        if matches!(
            round.stage(),
            Stage::LeaderCalculating | Stage::SubCalculating | Stage::SubsetCalculating
        ) {
            self.redispatch(round);
        }
        if matches!(round.stage(), Stage::LeaderCalculated | Stage::SubsetCalculated) {
            self.finalize(round, now);
        }
        self.poll_inclusion(round, now);
    }

    fn enter_path(&mut self, round: &mut Round, now: Instant) {
        match round.mode() {
            AgreementMode::CommonSubset => self.propose(round, now),
            AgreementMode::Leader => {
                let leader = round.leader();
                if leader == self.own() {
                    debug!(node = self.own(), round = %round.target_index(), "Entering leader path");
                    round.advance(Stage::LeaderStart, now);
                } else {
                    debug!(node = self.own(), leader, round = %round.target_index(), "Entering subordinate path");
                    round.advance(Stage::SubStart, now);
                }
            }
        }
    }

    fn resend_due(&self, round: &Round, now: Instant) -> bool {
        round
            .last_sent
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.resend_period())
    }

    fn notify_leader(&mut self, round: &mut Round, now: Instant) {
        let leader = round.leader();
        let mut ready = self.collab.pool.ready_requests();
        ready.sort_unstable();
        ready.dedup();
        self.last_ready = ready.len();
        round.notifications.record(self.own(), &ready);

        let digest = batch_hash(&ready);
        let unchanged = round.notified == Some((leader, digest));
        if unchanged && !self.resend_due(round, now) {
            return;
        }
        self.send(
            leader,
            &PeerMessage::NotifyRequests(NotifyRequests {
                baseline_id: *round.baseline_id(),
                request_ids: ready,
            }),
        );
        round.notified = Some((leader, digest));
        round.last_sent = Some(now);
        if round.stage() == Stage::SubStart {
            round.advance(Stage::SubNotified, now);
        }
    }

    fn start_instructed(&mut self, round: &mut Round, now: Instant) {
        if round.execution.is_some() {
            return;
        }
        let Some(instruction) = round.instruction.as_ref() else {
            return;
        };
        let batch = instruction.start.request_ids.clone();
        let params = instruction.start.params.clone();
        let hash = instruction.start.batch_hash;
        let Some(requests) = self.take_in_order(&batch) else {
            debug!(node = self.own(), batch = batch.len(), "Waiting for instructed requests");
            return;
        };
        let input = self.input(round, requests, &params);
        self.dispatch(round, input, hash);
        round.advance(Stage::SubCalculating, now);
    }

    fn lead(&mut self, round: &mut Round, now: Instant) {
        let own = self.own();
        let ready = self.collab.pool.ready_requests();
        self.last_ready = ready.len();
        round.notifications.record(own, &ready);

        let batch = select_by_notifications(&round.notifications, &ready, round.quorum());
        if batch.is_empty() {
            return;
        }
        let Some(requests) = self.take_in_order(&batch) else {
            warn!(node = own, batch = batch.len(), "Selected requests vanished from the pool");
            return;
        };
        let params = leader_parameters(round.baseline(), own, (self.clock)(), &self.config.fee_target);
        let start = StartProcessing::new(*round.baseline_id(), batch, params.clone());
        let hash = start.batch_hash;

        info!(
            node = own,
            round = %round.target_index(),
            batch = start.request_ids.len(),
            timestamp = %params.timestamp,
            "Leading round"
        );
        self.broadcast(&PeerMessage::StartProcessing(start.clone()));
        round.leader_start = Some(start);
        round.last_sent = Some(now);
        round.aggregator = Some(ResultAggregator::new(round.size, round.quorum()));
        let input = self.input(round, requests, &params);
        self.dispatch(round, input, hash);
        round.advance(Stage::LeaderCalculating, now);
    }

    fn resend_start(&mut self, round: &mut Round, now: Instant) {
        if !self.resend_due(round, now) {
            return;
        }
        if let Some(start) = &round.leader_start {
            trace!(node = self.own(), "Re-broadcasting start instruction");
            self.broadcast(&PeerMessage::StartProcessing(start.clone()));
            round.last_sent = Some(now);
        }
    }

    fn finalize(&mut self, round: &mut Round, now: Instant) {
        let node = self.own();
        let Some(aggregator) = round.aggregator.as_mut() else {
            return;
        };
        match aggregator.try_finalize(self.collab.keys.as_ref()) {
            Ok(None) => {}
            Ok(Some(transition)) => {
                info!(
                    node,
                    round = %round.target_index(),
                    tx = %transition.id(),
                    requests = transition.requests.len(),
                    "Transition finalized"
                );
                self.collab.ledger.post_transaction(&transition);
                self.broadcast(&PeerMessage::ResultPosted(ResultPosted {
                    baseline_id: *round.baseline_id(),
                    transition: transition.clone(),
                }));
                self.metrics
                    .transitions_finalized
                    .get_or_create(&ConsensusMetrics::node(node))
                    .inc();
                self.finish(round, transition, now);
            }
            Err(e) => error!(node, error = %e, "Failed to recover full signature"),
        }
    }

    fn finish(&mut self, round: &mut Round, transition: StateTransition, now: Instant) {
        round.finish(transition, self.config.inclusion_poll_period(), now);
        self.tracker.clear();
        self.metrics
            .round_duration_seconds
            .get_or_create(&ConsensusMetrics::node(self.own()))
            .observe(now.saturating_duration_since(round.started).as_secs_f64());
    }

    fn rotate(&mut self, round: &mut Round, now: Instant) {
        let node = self.own();
        let previous = round.leader();
        let transport = Arc::clone(&self.collab.transport);
        let leader = round.scheduler.rotate(|peer| transport.is_alive(peer));
        round.rotations += 1;
        self.last_ready = self.collab.pool.ready_requests().len();
        if self.last_ready > 0 {
            round.busy_rotations += 1;
        }
        round.restart(now);
        self.tracker.clear();
        self.metrics
            .rotations
            .get_or_create(&ConsensusMetrics::node(node))
            .inc();
        info!(
            node,
            round = %round.target_index(),
            previous,
            leader,
            rotations = round.rotations(),
            "Leader rotated"
        );

        let limit = self.config.acs_after_rotations;
        // An idle chain keeps rotating in leader mode.
        if limit > 0 && round.busy_rotations >= limit {
            warn!(node, rotations = round.rotations(), "Falling back to common-subset agreement");
            round.enter_subset_mode();
            self.metrics
                .subset_fallbacks
                .get_or_create(&ConsensusMetrics::node(node))
                .inc();
        }
    }

    fn poll_inclusion(&mut self, round: &mut Round, now: Instant) {
        let node = self.own();
        let target = round.target_index();
        let Some(posted) = round.posted.as_mut() else {
            return;
        };
        if posted.inclusion != InclusionState::Pending || now < posted.next_poll {
            return;
        }
        let state = self.collab.ledger.poll_inclusion_state(&posted.id);
        posted.inclusion = state;
        let labels = ConsensusMetrics::node(node);
        match state {
            InclusionState::Pending => {
                posted.next_poll = now + self.config.inclusion_poll_period();
            }
            InclusionState::Confirmed => {
                info!(node, round = %target, tx = %posted.id, "Transition confirmed");
                self.metrics.transitions_confirmed.get_or_create(&labels).inc();
            }
            InclusionState::Rejected => {
                error!(
                    node,
                    round = %target,
                    tx = %posted.id,
                    "CRITICAL: ledger rejected a finalized transition; no automated remedy"
                );
                self.metrics.transitions_rejected.get_or_create(&labels).inc();
            }
        }
    }

    fn snapshot(&self, round: Option<&Round>) -> StatusSnapshot {
        let Some(round) = round else {
            return StatusSnapshot::idle(self.own());
        };
        StatusSnapshot {
            node: self.own(),
            round_index: Some(round.target_index()),
            baseline_id: Some(*round.baseline_id()),
            stage: round.stage(),
            mode: round.mode(),
            leader: (round.mode() == AgreementMode::Leader).then(|| round.leader()),
            rotations: round.rotations(),
            quorum_alive: self.collab.transport.quorum_alive(),
            pending: PendingCounts {
                ready_requests: self.last_ready,
                notified_requests: round.notifications.len(),
                in_flight_requests: self.tracker.len(),
                signed_results: round.signed_results(),
            },
            finalized_tx: round.posted.as_ref().map(|p| p.id),
            inclusion: round.posted.as_ref().map(|p| p.inclusion),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leader::LeaderScheduler;
    use crate::metrics::DropLabels;
    use crate::testing::{
        genesis, DeterministicExecutor, LocalNetwork, LocalSubset, MemoryLedger, MemoryPool,
        MockKeyShare,
    };
    use crate::collaborators::KeyShare;
    use crate::transition::{ResultEssence, ResultState};
    use concord_types::{IdentityKey, LedgerAnchor, RequestKind, SignatureShare, StateIndex};

    const GROUP: &[u8] = b"engine-test";

    struct Harness {
        engine: ConsensusEngine,
        network: Arc<LocalNetwork>,
        pool: Arc<MemoryPool>,
        metrics: Arc<ConsensusMetrics>,
    }

    fn committee(own: PeerIndex) -> CommitteeView {
        let keys: Vec<IdentityKey> = (0..4u16)
            .map(|i| PeerIdentity::for_devnet(i).public_key())
            .collect();
        CommitteeView::new(own, keys).unwrap()
    }

    fn harness(own: PeerIndex) -> Harness {
        let network = LocalNetwork::new(4);
        let pool = Arc::new(MemoryPool::new());
        let metrics = Arc::new(ConsensusMetrics::new());
        let collab = Collaborators {
            transport: Arc::new(network.transport(own)),
            keys: Arc::new(MockKeyShare::new(GROUP, 4, own)),
            ledger: Arc::new(MemoryLedger::new(MockKeyShare::new(GROUP, 4, own), 1)),
            pool: pool.clone(),
            subset: Arc::new(LocalSubset::new(4)),
        };
        let engine = ConsensusEngine::new(
            EngineConfig::default(),
            committee(own),
            PeerIdentity::for_devnet(own),
            collab,
        )
        .unwrap()
        .with_metrics(Arc::clone(&metrics));
        Harness {
            engine,
            network,
            pool,
            metrics,
        }
    }

    fn genesis_leader() -> PeerIndex {
        LeaderScheduler::new(4, &genesis().anchor.bytes).current()
    }

    fn notify(sender: PeerIndex, baseline_id: BaselineId, ids: Vec<RequestId>) -> Event {
        let message = PeerMessage::NotifyRequests(NotifyRequests {
            baseline_id,
            request_ids: ids,
        });
        Event::PeerMessage {
            sender,
            kind: message.kind(),
            payload: message.encode().unwrap(),
        }
    }

    fn dropped(h: &Harness, kind: &str, reason: &str) -> u64 {
        h.metrics
            .messages_dropped
            .get_or_create(&DropLabels {
                node: h.engine.own_index(),
                kind: kind.to_string(),
                reason: reason.to_string(),
            })
            .get()
    }

    #[test]
    fn test_identity_must_match_committee() {
        let network = LocalNetwork::new(4);
        let collab = Collaborators {
            transport: Arc::new(network.transport(0)),
            keys: Arc::new(MockKeyShare::new(GROUP, 4, 0)),
            ledger: Arc::new(MemoryLedger::new(MockKeyShare::new(GROUP, 4, 0), 1)),
            pool: Arc::new(MemoryPool::new()),
            subset: Arc::new(LocalSubset::new(4)),
        };
        let result = ConsensusEngine::new(
            EngineConfig::default(),
            committee(0),
            PeerIdentity::for_devnet(1),
            collab,
        );
        assert!(matches!(result, Err(ConsensusError::IdentityMismatch { index: 0 })));
    }

    #[test]
    fn test_newer_baseline_replaces_round() {
        let mut h = harness(0);
        let now = Instant::now();
        h.engine.step(Event::NewBaseline(genesis()), now);
        assert_eq!(h.engine.round().unwrap().target_index(), StateIndex(1));
        assert!(h.engine.status().stage != Stage::Idle);

        let next = Baseline::new(
            StateIndex(5),
            Digest::hash(b"five"),
            LedgerAnchor::from_bytes(b"five".to_vec()),
            Timestamp::from_millis(1),
        );
        h.engine.step(Event::NewBaseline(next.clone()), now);
        assert_eq!(h.engine.round().unwrap().target_index(), StateIndex(6));

        h.engine.step(Event::NewBaseline(genesis()), now);
        assert_eq!(h.engine.round().unwrap().baseline(), &next);

        let labels = ConsensusMetrics::node(0);
        assert_eq!(h.metrics.rounds_started.get_or_create(&labels).get(), 2);
        assert_eq!(h.metrics.rounds_abandoned.get_or_create(&labels).get(), 1);
    }

    #[test]
    fn test_invalid_and_stale_messages_dropped() {
        let mut h = harness(0);
        let now = Instant::now();
        h.engine.step(Event::NewBaseline(genesis()), now);
        let id = genesis().id();
        let kind = MessageKind::NotifyRequests.as_str();

        h.engine.step(notify(0, id, vec![]), now);
        h.engine.step(notify(9, id, vec![]), now);
        assert_eq!(dropped(&h, kind, "invalid_sender"), 2);

        let other = BaselineId::new(Digest::hash(b"other"));
        h.engine.step(notify(1, other, vec![]), now);
        assert_eq!(dropped(&h, kind, "stale"), 1);

        h.engine.step(
            Event::PeerMessage {
                sender: 1,
                kind: MessageKind::StartProcessing,
                payload: Bytes::from_static(b"{not json"),
            },
            now,
        );
        assert_eq!(dropped(&h, MessageKind::StartProcessing.as_str(), "malformed"), 1);
    }

    #[test]
    fn test_subordinate_ignores_start_from_non_leader() {
        let leader = genesis_leader();
        let own = (leader + 1) % 4;
        let impostor = (leader + 2) % 4;
        let mut h = harness(own);
        let now = Instant::now();
        h.engine.step(Event::NewBaseline(genesis()), now);
        assert_eq!(h.engine.status().stage, Stage::SubNotified);

        let request = Request::new(RequestKind::OffLedger, b"r".to_vec());
        h.pool.add(request.clone());
        let params = leader_parameters(&genesis(), impostor, Timestamp::now(), "base");
        let start = PeerMessage::StartProcessing(StartProcessing::new(
            genesis().id(),
            vec![request.id],
            params,
        ));
        let tasks = h.engine.step(
            Event::PeerMessage {
                sender: impostor,
                kind: start.kind(),
                payload: start.encode().unwrap(),
            },
            now,
        );
        assert!(tasks.is_empty());
        assert_eq!(dropped(&h, start.kind().as_str(), "not_current_leader"), 1);
        assert_eq!(h.engine.status().stage, Stage::SubNotified);
    }

    #[test]
    fn test_leader_retries_failed_execution() {
        let leader = genesis_leader();
        let mut h = harness(leader);
        let now = Instant::now();
        let request = Request::new(RequestKind::OffLedger, b"work".to_vec());
        h.pool.add(request.clone());

        h.engine.step(Event::NewBaseline(genesis()), now);
        assert_eq!(h.engine.status().stage, Stage::LeaderStart);

        let peers: Vec<PeerIndex> = (0..4).filter(|p| *p != leader).collect();
        assert!(h.engine.step(notify(peers[0], genesis().id(), vec![request.id]), now).is_empty());
        let tasks = h.engine.step(notify(peers[1], genesis().id(), vec![request.id]), now);
        assert_eq!(tasks.len(), 1);
        assert_eq!(h.engine.status().stage, Stage::LeaderCalculating);
        assert!(h.engine.tracker().is_in_flight(&request.id));

        let starts = h
            .network
            .drain()
            .into_iter()
            .filter(|e| e.kind == MessageKind::StartProcessing)
            .count();
        assert_eq!(starts, 3);

        let first = tasks.into_iter().next().unwrap();
        let first_attempt = first.attempt;
        let failed = first.complete(Err(ConsensusError::Execution("boom".into())));
        let retry = h.engine.step(Event::ExecutionComplete(failed), now);
        assert_eq!(retry.len(), 1);
        assert!(retry[0].attempt > first_attempt);

        let stale = ExecutionTask {
            attempt: first_attempt,
            baseline_id: genesis().id(),
            input: retry[0].input.clone(),
        };
        let output = DeterministicExecutor::new().run_now(&stale.input);
        assert!(h
            .engine
            .step(Event::ExecutionComplete(stale.complete(output)), now)
            .is_empty());
        assert_eq!(h.engine.status().stage, Stage::LeaderCalculating);

        let task = retry.into_iter().next().unwrap();
        let output = DeterministicExecutor::new().run_now(&task.input);
        h.engine.step(Event::ExecutionComplete(task.complete(output)), now);
        assert_eq!(h.engine.status().stage, Stage::LeaderCalculated);
        assert_eq!(h.engine.status().pending.signed_results, 1);
    }

    fn signed_transition(commitment: &[u8]) -> StateTransition {
        let mut transition = StateTransition::new(
            genesis().id(),
            ResultState {
                state_index: StateIndex(1),
                commitment: Digest::hash(commitment),
            },
            ResultEssence(b"essence".to_vec()).digest(),
            Vec::new(),
            genesis().timestamp.saturating_add_millis(1),
        );
        let message = transition.signed_digest();
        let shares: Vec<(PeerIndex, SignatureShare)> = (0..4u16)
            .map(|p| (p, MockKeyShare::new(GROUP, 4, p).sign_share(message.as_bytes())))
            .collect();
        let signature = MockKeyShare::new(GROUP, 4, 0)
            .recover_full_signature(&shares, message.as_bytes())
            .unwrap();
        transition.signature = Some(signature);
        transition
    }

    fn posted(sender: PeerIndex, transition: StateTransition) -> Event {
        let message = PeerMessage::ResultPosted(ResultPosted {
            baseline_id: genesis().id(),
            transition,
        });
        Event::PeerMessage {
            sender,
            kind: message.kind(),
            payload: message.encode().unwrap(),
        }
    }

    #[test]
    fn test_posted_transition_with_moved_signature_is_dropped() {
        let leader = genesis_leader();
        let mut h = harness((leader + 1) % 4);
        let now = Instant::now();
        h.engine.step(Event::NewBaseline(genesis()), now);
        let kind = MessageKind::ResultPosted.as_str();

        let genuine = signed_transition(b"state");
        let mut forged = genuine.clone();
        forged.state.commitment = Digest::hash(b"forged");
        forged.requests.push(RequestId::derive(b"injected"));

        h.engine.step(posted(leader, forged), now);
        assert_eq!(dropped(&h, kind, "invalid_signature"), 1);
        assert_eq!(h.engine.status().stage, Stage::SubNotified);

        h.engine.step(posted(leader, genuine.clone()), now);
        assert_eq!(h.engine.status().stage, Stage::SubFinalized);
        assert_eq!(h.engine.status().finalized_tx, Some(genuine.id()));
    }

    #[test]
    fn test_subordinate_result_is_resent_and_checked_against_posted() {
        let leader = genesis_leader();
        let own = (leader + 1) % 4;
        let mut h = harness(own);
        let now = Instant::now();
        let request = Request::new(RequestKind::OffLedger, b"r".to_vec());
        h.pool.add(request.clone());
        h.engine.step(Event::NewBaseline(genesis()), now);

        let params = leader_parameters(&genesis(), leader, Timestamp::now(), "base");
        let start = PeerMessage::StartProcessing(StartProcessing::new(
            genesis().id(),
            vec![request.id],
            params,
        ));
        let instruct = || Event::PeerMessage {
            sender: leader,
            kind: start.kind(),
            payload: start.encode().unwrap(),
        };
        let task = h.engine.step(instruct(), now).into_iter().next().unwrap();
        let output = DeterministicExecutor::new().run_now(&task.input);
        h.engine.step(Event::ExecutionComplete(task.complete(output)), now);
        assert_eq!(h.engine.status().stage, Stage::SubCalculated);

        let signed_results = |h: &Harness| {
            h.network
                .drain()
                .into_iter()
                .filter(|e| e.kind == MessageKind::SignedResult && e.to == leader)
                .count()
        };
        assert_eq!(signed_results(&h), 1);

        h.engine.step(instruct(), now);
        assert_eq!(dropped(&h, start.kind().as_str(), "duplicate"), 1);
        assert_eq!(signed_results(&h), 1);

        // Quorum-signed, but not what this member computed.
        h.engine.step(posted(leader, signed_transition(b"elsewhere")), now);
        assert_eq!(dropped(&h, MessageKind::ResultPosted.as_str(), "result_mismatch"), 1);
        assert_eq!(h.engine.status().stage, Stage::SubCalculated);
    }

    #[test]
    fn test_idle_rotations_do_not_fall_back() {
        let network = LocalNetwork::new(4);
        let pool = Arc::new(MemoryPool::new());
        let metrics = Arc::new(ConsensusMetrics::new());
        let own = (genesis_leader() + 1) % 4;
        let collab = Collaborators {
            transport: Arc::new(network.transport(own)),
            keys: Arc::new(MockKeyShare::new(GROUP, 4, own)),
            ledger: Arc::new(MemoryLedger::new(MockKeyShare::new(GROUP, 4, own), 1)),
            pool: pool.clone(),
            subset: Arc::new(LocalSubset::new(4)),
        };
        let config = EngineConfig {
            stage_timeout_ms: 100,
            acs_after_rotations: 1,
            ..EngineConfig::default()
        };
        let mut engine = ConsensusEngine::new(config, committee(own), PeerIdentity::for_devnet(own), collab)
            .unwrap()
            .with_metrics(Arc::clone(&metrics));
        let labels = ConsensusMetrics::node(own);
        let mut now = Instant::now();
        engine.step(Event::NewBaseline(genesis()), now);

        for _ in 0..3 {
            now += std::time::Duration::from_millis(150);
            engine.step(Event::TimerTick, now);
        }
        assert_eq!(engine.status().rotations, 3);
        assert_eq!(engine.status().mode, AgreementMode::Leader);
        assert_eq!(metrics.subset_fallbacks.get_or_create(&labels).get(), 0);

        pool.add(Request::new(RequestKind::OffLedger, b"work".to_vec()));
        now += std::time::Duration::from_millis(150);
        engine.step(Event::TimerTick, now);
        assert_eq!(engine.status().mode, AgreementMode::CommonSubset);
        assert_eq!(metrics.subset_fallbacks.get_or_create(&labels).get(), 1);
    }
}

//! Deterministic multi-node simulation with virtual time.
//!
//! Every member runs a real [`ConsensusEngine`] wired to in-memory
//! collaborators. Messages are delivered in FIFO order, executions complete
//! synchronously and time only moves when [`Simulation::tick`] is called.
//! A confirmed transition becomes the next baseline for every live member.

use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::engine::{ConsensusEngine, Event, ExecutionTask};
use crate::error::Result;
use crate::metrics::ConsensusMetrics;
use crate::status::StatusSnapshot;
use crate::testing::{
    DeterministicExecutor, LocalNetwork, LocalSubset, MemoryLedger, MemoryPool, MockKeyShare,
};
use concord_types::{
    Baseline, CommitteeView, Digest, IdentityKey, LedgerAnchor, PeerIdentity, PeerIndex, Request,
    StateIndex, Timestamp,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const GROUP: &[u8] = b"concord-simulation";
const GENESIS_MILLIS: u64 = 1_700_000_000_000;
const SETTLE_LIMIT: usize = 10_000;

/// One simulated committee member.
#[derive(Debug)]
pub struct SimNode {
    /// The member's engine.
    pub engine: ConsensusEngine,
    /// The member's request pool.
    pub pool: Arc<MemoryPool>,
    /// The member's execution engine.
    pub executor: Arc<DeterministicExecutor>,
}

/// Configures a [`Simulation`].
#[derive(Debug, Clone)]
pub struct SimulationBuilder {
    size: u16,
    config: EngineConfig,
    faulty_keys: Vec<PeerIndex>,
    divergent: Vec<PeerIndex>,
    confirm_after: u32,
    tick: Duration,
}

impl SimulationBuilder {
    /// Engine configuration shared by every member.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Gives `peer` a key share that signs garbage.
    pub fn faulty_keys(mut self, peer: PeerIndex) -> Self {
        self.faulty_keys.push(peer);
        self
    }

    /// Gives `peer` an executor that computes a different essence.
    pub fn divergent(mut self, peer: PeerIndex) -> Self {
        self.divergent.push(peer);
        self
    }

    /// Inclusion polls before the ledger confirms a transaction.
    pub fn confirm_after(mut self, polls: u32) -> Self {
        self.confirm_after = polls;
        self
    }

    /// Virtual time advanced per tick.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Builds the committee.
    pub fn build(self) -> Result<Simulation> {
        let network = LocalNetwork::new(self.size);
        let subset = Arc::new(LocalSubset::new(self.size));
        let ledger = Arc::new(MemoryLedger::new(
            MockKeyShare::new(GROUP, self.size, 0),
            self.confirm_after,
        ));
        let metrics = Arc::new(ConsensusMetrics::new());
        let wall = Arc::new(AtomicU64::new(GENESIS_MILLIS));
        let identities: Vec<IdentityKey> = (0..self.size)
            .map(|i| PeerIdentity::for_devnet(i).public_key())
            .collect();

        let mut nodes = Vec::with_capacity(usize::from(self.size));
        for peer in 0..self.size {
            let mut keys = MockKeyShare::new(GROUP, self.size, peer);
            if self.faulty_keys.contains(&peer) {
                keys = keys.faulty();
            }
            let executor = if self.divergent.contains(&peer) {
                DeterministicExecutor::divergent(&peer.to_be_bytes())
            } else {
                DeterministicExecutor::new()
            };
            let pool = Arc::new(MemoryPool::new());
            let collaborators = Collaborators {
                transport: Arc::new(network.transport(peer)),
                keys: Arc::new(keys),
                ledger: ledger.clone(),
                pool: pool.clone(),
                subset: subset.clone(),
            };
            let committee = CommitteeView::new(peer, identities.clone())?;
            let clock = Arc::clone(&wall);
            let engine = ConsensusEngine::new(
                self.config.clone(),
                committee,
                PeerIdentity::for_devnet(peer),
                collaborators,
            )?
            .with_metrics(Arc::clone(&metrics))
            .with_wall_clock(move || Timestamp::from_millis(clock.load(Ordering::SeqCst)));
            nodes.push(SimNode {
                engine,
                pool,
                executor: Arc::new(executor),
            });
        }

        Ok(Simulation {
            network,
            ledger,
            subset,
            metrics,
            nodes,
            baseline: genesis(),
            now: Instant::now(),
            wall,
            tick: self.tick,
            confirmed_seen: 0,
            tasks: Vec::new(),
        })
    }
}

/// The baseline every simulation starts from.
pub fn genesis() -> Baseline {
    Baseline::new(
        StateIndex(0),
        Digest::hash(b"genesis"),
        LedgerAnchor::from_bytes(b"genesis".to_vec()),
        Timestamp::from_millis(GENESIS_MILLIS),
    )
}

/// A committee of engines on a shared in-memory network and ledger.
#[derive(Debug)]
pub struct Simulation {
    network: Arc<LocalNetwork>,
    ledger: Arc<MemoryLedger>,
    subset: Arc<LocalSubset>,
    metrics: Arc<ConsensusMetrics>,
    nodes: Vec<SimNode>,
    baseline: Baseline,
    now: Instant,
    wall: Arc<AtomicU64>,
    tick: Duration,
    confirmed_seen: usize,
    tasks: Vec<(PeerIndex, ExecutionTask)>,
}

impl Simulation {
    /// Starts configuring a committee of `size`.
    ///
    /// Defaults: one second stage timeout, 100ms ticks, confirmation after
    /// two polls.
    pub fn builder(size: u16) -> SimulationBuilder {
        SimulationBuilder {
            size,
            config: EngineConfig {
                stage_timeout_ms: 1_000,
                inclusion_poll_ms: 200,
                resend_ms: 500,
                ..EngineConfig::default()
            },
            faulty_keys: Vec::new(),
            divergent: Vec::new(),
            confirm_after: 2,
            tick: Duration::from_millis(100),
        }
    }

    /// Delivers the genesis baseline to every live member.
    pub fn start(&mut self) {
        let baseline = self.baseline.clone();
        self.broadcast_baseline(baseline);
    }

    /// Adds `request` to every member's pool.
    pub fn submit(&self, request: Request) {
        for node in &self.nodes {
            node.pool.add(request.clone());
        }
    }

    /// Adds `request` to the pools of `peers` only.
    pub fn submit_to(&self, peers: &[PeerIndex], request: Request) {
        for peer in peers {
            if let Some(node) = self.nodes.get(usize::from(*peer)) {
                node.pool.add(request.clone());
            }
        }
    }

    /// Stops delivering to and from `peer`.
    pub fn kill(&self, peer: PeerIndex) {
        self.network.set_alive(peer, false);
    }

    /// Resumes delivery for `peer`.
    pub fn revive(&self, peer: PeerIndex) {
        self.network.set_alive(peer, true);
    }

    /// A member.
    pub fn node(&self, peer: PeerIndex) -> &SimNode {
        &self.nodes[usize::from(peer)]
    }

    /// All members.
    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    /// Published status of `peer`.
    pub fn status(&self, peer: PeerIndex) -> Arc<StatusSnapshot> {
        self.node(peer).engine.status()
    }

    /// Latest confirmed baseline.
    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    /// Current virtual time.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Shared ledger.
    pub fn ledger(&self) -> &MemoryLedger {
        &self.ledger
    }

    /// Shared network.
    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    /// Shared subset agreement.
    pub fn subset(&self) -> &LocalSubset {
        &self.subset
    }

    /// Metrics of every member.
    pub fn metrics(&self) -> &ConsensusMetrics {
        &self.metrics
    }

    /// Delivers an event to `peer` and settles the committee.
    pub fn deliver(&mut self, peer: PeerIndex, event: Event) {
        self.step_node(peer, event);
        self.settle();
    }

    /// Advances virtual time by one tick.
    pub fn tick(&mut self) {
        self.now += self.tick;
        let millis = u64::try_from(self.tick.as_millis()).unwrap_or(u64::MAX);
        self.wall.fetch_add(millis, Ordering::SeqCst);
        for peer in 0..self.size() {
            self.step_node(peer, Event::TimerTick);
        }
        self.settle();
        self.advance_baseline();
    }

    /// Ticks until `done` holds or `max_ticks` elapse.
    pub fn run_until(&mut self, max_ticks: usize, done: impl Fn(&Simulation) -> bool) -> bool {
        for _ in 0..max_ticks {
            if done(self) {
                return true;
            }
            self.tick();
        }
        done(self)
    }

    fn size(&self) -> PeerIndex {
        self.network.size()
    }

    fn step_node(&mut self, peer: PeerIndex, event: Event) {
        if !self.network.is_alive(peer) {
            return;
        }
        let now = self.now;
        let Some(node) = self.nodes.get_mut(usize::from(peer)) else {
            return;
        };
        let tasks = node.engine.step(event, now);
        self.tasks.extend(tasks.into_iter().map(|t| (peer, t)));
    }

    /// Delivers messages, decisions and execution results until quiet.
    fn settle(&mut self) {
        for _ in 0..SETTLE_LIMIT {
            let envelopes = self.network.drain();
            let decisions = self.subset.drain_decisions();
            let tasks = std::mem::take(&mut self.tasks);
            if envelopes.is_empty() && decisions.is_empty() && tasks.is_empty() {
                return;
            }
            for envelope in envelopes {
                self.step_node(
                    envelope.to,
                    Event::PeerMessage {
                        sender: envelope.from,
                        kind: envelope.kind,
                        payload: envelope.payload,
                    },
                );
            }
            for decision in decisions {
                for peer in 0..self.size() {
                    self.step_node(peer, Event::SubsetAgreed(decision.clone()));
                }
            }
            for (peer, task) in tasks {
                let result = self.nodes[usize::from(peer)].executor.run_now(&task.input);
                self.step_node(peer, Event::ExecutionComplete(task.complete(result)));
            }
        }
        warn!("Simulation did not settle");
    }

    fn advance_baseline(&mut self) {
        let confirmed = self.ledger.confirmed();
        let fresh = confirmed.get(self.confirmed_seen..).unwrap_or_default();
        let Some(latest) = fresh
            .iter()
            .filter(|t| t.state.state_index > self.baseline.state_index)
            .max_by_key(|t| t.state.state_index)
        else {
            self.confirmed_seen = confirmed.len();
            return;
        };
        let baseline = MemoryLedger::baseline_for(latest);
        for transition in fresh {
            for node in &self.nodes {
                node.pool.remove(&transition.requests);
            }
        }
        self.confirmed_seen = confirmed.len();
        debug!(index = %baseline.state_index, "Simulation baseline advanced");
        self.broadcast_baseline(baseline);
    }

    fn broadcast_baseline(&mut self, baseline: Baseline) {
        self.baseline = baseline.clone();
        for peer in 0..self.size() {
            self.step_node(peer, Event::NewBaseline(baseline.clone()));
        }
        self.settle();
    }
}

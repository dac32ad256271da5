//! An in-process committee.
//!
//! Every member runs a real consensus engine on the tokio runtime. The
//! members share an in-memory network, common-subset agreement and ledger.
//! A router task moves messages and decisions between them and turns
//! confirmed transitions into the next baseline.

use crate::config::{DevnetConfig, NodeConfig};
use crate::observability::MetricsState;
use concord_consensus::testing::{
    DeterministicExecutor, LocalNetwork, LocalSubset, MemoryLedger, MemoryPool, MockKeyShare,
};
use concord_consensus::{
    spawn_engine, spawn_ticker, Collaborators, ConsensusEngine, ConsensusError, EngineHandle,
};
use concord_types::{
    Baseline, CommitteeView, Digest, IdentityKey, LedgerAnchor, PeerIdentity, PeerIndex, Request,
    RequestKind, StateIndex, Timestamp,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const GROUP: &[u8] = b"concord-devnet";
const ROUTE_PERIOD: Duration = Duration::from_millis(5);

/// One member slot; offline members have no engine.
#[derive(Debug)]
pub struct Member {
    /// Committee index.
    pub index: PeerIndex,
    /// Handle to the running engine.
    pub handle: Option<EngineHandle>,
    /// The member's request pool.
    pub pool: Arc<MemoryPool>,
}

/// A running committee.
#[derive(Debug)]
pub struct Devnet {
    members: Arc<Vec<Member>>,
    network: Arc<LocalNetwork>,
    ledger: Arc<MemoryLedger>,
    metrics: MetricsState,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// The first baseline of a devnet.
pub fn devnet_genesis() -> Baseline {
    Baseline::new(
        StateIndex(0),
        Digest::hash(GROUP),
        LedgerAnchor::from_bytes(GROUP.to_vec()),
        Timestamp::now(),
    )
}

impl Devnet {
    /// Spawns the committee described by `config` on the current runtime.
    pub fn spawn(config: &NodeConfig, metrics: MetricsState) -> Result<Self, ConsensusError> {
        let devnet = &config.devnet;
        let size = devnet.committee_size;
        let network = LocalNetwork::new(size);
        let subset = Arc::new(LocalSubset::new(size));
        let ledger = Arc::new(MemoryLedger::new(
            MockKeyShare::new(GROUP, size, 0),
            devnet.confirm_after,
        ));
        let consensus_metrics = Arc::new(metrics.consensus.clone());
        let identities: Vec<IdentityKey> = (0..size)
            .map(|i| PeerIdentity::for_devnet(i).public_key())
            .collect();
        let cancel = CancellationToken::new();

        let mut members = Vec::with_capacity(usize::from(size));
        let mut tasks = Vec::new();
        for index in 0..size {
            let pool = Arc::new(MemoryPool::new());
            if devnet.offline.contains(&index) {
                network.set_alive(index, false);
                info!(node = index, "Member configured offline");
                members.push(Member {
                    index,
                    handle: None,
                    pool,
                });
                continue;
            }

            let collaborators = Collaborators {
                transport: Arc::new(network.transport(index)),
                keys: Arc::new(MockKeyShare::new(GROUP, size, index)),
                ledger: ledger.clone(),
                pool: pool.clone(),
                subset: subset.clone(),
            };
            let engine = ConsensusEngine::new(
                config.engine.clone(),
                CommitteeView::new(index, identities.clone())?,
                PeerIdentity::for_devnet(index),
                collaborators,
            )?
            .with_metrics(Arc::clone(&consensus_metrics));

            let (handle, task) = spawn_engine(engine, Arc::new(DeterministicExecutor::new()));
            tasks.push(task);
            tasks.push(spawn_ticker(handle.clone(), devnet.tick()));
            metrics.committee_members_running.inc();
            members.push(Member {
                index,
                handle: Some(handle),
                pool,
            });
        }

        let members = Arc::new(members);
        tasks.push(tokio::spawn(route(
            members.clone(),
            network.clone(),
            subset,
            ledger.clone(),
            cancel.clone(),
        )));
        if let Some(period) = devnet.request_interval() {
            tasks.push(tokio::spawn(generate_requests(
                members.clone(),
                period,
                cancel.clone(),
            )));
        }

        info!(
            size,
            offline = devnet.offline.len(),
            mode = config.engine.initial_mode.as_str(),
            "Devnet committee spawned"
        );
        Ok(Self {
            members,
            network,
            ledger,
            metrics,
            cancel,
            tasks,
        })
    }

    /// Delivers `baseline` to every running member.
    pub async fn start(&self, baseline: Baseline) -> Result<(), ConsensusError> {
        broadcast_baseline(&self.members, baseline).await
    }

    /// Adds `request` to every member's pool.
    pub fn submit(&self, request: Request) {
        for member in self.members.iter() {
            member.pool.add(request.clone());
        }
    }

    /// All member slots.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Shared member list for API handlers.
    pub fn shared_members(&self) -> Arc<Vec<Member>> {
        self.members.clone()
    }

    /// The shared ledger.
    pub fn ledger(&self) -> &MemoryLedger {
        &self.ledger
    }

    /// Stops every task and waits for them.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.members.iter().filter_map(|m| m.handle.as_ref()) {
            handle.shutdown();
            self.metrics.committee_members_running.dec();
        }
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Devnet task failed");
            }
        }
        info!(
            sent = self.network.sent(),
            dropped = self.network.dropped(),
            "Devnet stopped"
        );
    }
}

impl DevnetConfig {
    /// Members that run an engine.
    pub fn running_members(&self) -> usize {
        usize::from(self.committee_size).saturating_sub(self.offline.len())
    }
}

async fn broadcast_baseline(members: &[Member], baseline: Baseline) -> Result<(), ConsensusError> {
    for handle in members.iter().filter_map(|m| m.handle.as_ref()) {
        handle.on_new_baseline(baseline.clone()).await?;
    }
    Ok(())
}

/// Moves traffic between members until cancelled.
async fn route(
    members: Arc<Vec<Member>>,
    network: Arc<LocalNetwork>,
    subset: Arc<LocalSubset>,
    ledger: Arc<MemoryLedger>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(ROUTE_PERIOD);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut confirmed_seen = 0;
    let mut tip = StateIndex(0);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let mut stopped = false;
        for envelope in network.drain() {
            let Some(handle) = members
                .get(usize::from(envelope.to))
                .and_then(|m| m.handle.as_ref())
            else {
                continue;
            };
            stopped |= handle
                .on_peer_message(envelope.from, envelope.kind, envelope.payload)
                .await
                .is_err();
        }
        for decision in subset.drain_decisions() {
            for handle in members.iter().filter_map(|m| m.handle.as_ref()) {
                stopped |= handle.on_subset_agreed(decision.clone()).await.is_err();
            }
        }

        let confirmed = ledger.confirmed();
        let fresh = confirmed.get(confirmed_seen..).unwrap_or_default();
        confirmed_seen = confirmed.len();
        for transition in fresh {
            for member in members.iter() {
                member.pool.remove(&transition.requests);
            }
        }
        if let Some(latest) = fresh
            .iter()
            .filter(|t| t.state.state_index > tip)
            .max_by_key(|t| t.state.state_index)
        {
            tip = latest.state.state_index;
            let baseline = MemoryLedger::baseline_for(latest);
            info!(
                index = %baseline.state_index,
                requests = latest.requests.len(),
                "Transition confirmed, advancing baseline"
            );
            stopped |= broadcast_baseline(&members, baseline).await.is_err();
        }

        if stopped && !cancel.is_cancelled() {
            warn!("Member engine stopped, routing ends");
            break;
        }
    }
    debug!("Router stopped");
}

/// Submits a fresh request to every pool each `period`.
async fn generate_requests(members: Arc<Vec<Member>>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sequence: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let request = Request::new(
                    RequestKind::OffLedger,
                    format!("devnet-request-{sequence}").into_bytes(),
                );
                debug!(id = %request.id, "Generated request");
                for member in members.iter() {
                    member.pool.add(request.clone());
                }
                sequence += 1;
            }
        }
    }
}

//! Async driver for a [`ConsensusEngine`].
//!
//! The engine runs on its own task and owns all round state. Callers talk to
//! it through an [`EngineHandle`], one bounded mailbox per event kind, and
//! read its status without going through the task. Executions are spawned
//! on the runtime and report back through the execution mailbox.

use crate::collaborators::{ExecutionEngine, SubsetDecision};
use crate::engine::{ConsensusEngine, Event, ExecutionCompletion};
use crate::error::{ConsensusError, Result};
use crate::message::MessageKind;
use crate::status::{RequestTracker, StatusCell, StatusSnapshot};
use bytes::Bytes;
use concord_types::{Baseline, PeerIndex};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A payload received from a peer, as queued for the engine.
type Inbound = (PeerIndex, MessageKind, Bytes);

/// Cloneable handle to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    baselines: mpsc::Sender<Baseline>,
    messages: mpsc::Sender<Inbound>,
    executions: mpsc::Sender<ExecutionCompletion>,
    decisions: mpsc::Sender<SubsetDecision>,
    ticks: mpsc::Sender<()>,
    status: Arc<StatusCell>,
    tracker: Arc<RequestTracker>,
    cancel: CancellationToken,
}

impl EngineHandle {
    /// Reports a newly confirmed baseline.
    pub async fn on_new_baseline(&self, baseline: Baseline) -> Result<()> {
        self.baselines
            .send(baseline)
            .await
            .map_err(|_| ConsensusError::EngineStopped)
    }

    /// Hands over a payload received from `sender`.
    pub async fn on_peer_message(
        &self,
        sender: PeerIndex,
        kind: MessageKind,
        payload: Bytes,
    ) -> Result<()> {
        self.messages
            .send((sender, kind, payload))
            .await
            .map_err(|_| ConsensusError::EngineStopped)
    }

    /// Reports an execution finished outside the runner.
    pub async fn on_execution_complete(&self, completion: ExecutionCompletion) -> Result<()> {
        self.executions
            .send(completion)
            .await
            .map_err(|_| ConsensusError::EngineStopped)
    }

    /// Reports a common-subset decision.
    pub async fn on_subset_agreed(&self, decision: SubsetDecision) -> Result<()> {
        self.decisions
            .send(decision)
            .await
            .map_err(|_| ConsensusError::EngineStopped)
    }

    /// Requests a re-evaluation.
    ///
    /// Ticks carry no data, so one already queued is as good as another.
    pub fn on_timer_tick(&self) -> Result<()> {
        match self.ticks.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(ConsensusError::EngineStopped),
        }
    }

    /// Latest published status.
    pub fn status_snapshot(&self) -> Arc<StatusSnapshot> {
        self.status.load()
    }

    /// In-flight request bookkeeping.
    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Stops the engine task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Spawns `engine` on the current runtime.
///
/// Executions it requests run on `executor` as separate tasks.
pub fn spawn_engine(
    mut engine: ConsensusEngine,
    executor: Arc<dyn ExecutionEngine>,
) -> (EngineHandle, JoinHandle<()>) {
    let capacity = engine.config().mailbox_size.max(1);
    let (baselines, mut baseline_rx) = mpsc::channel(capacity);
    let (messages, mut message_rx) = mpsc::channel::<Inbound>(capacity);
    let (executions, mut execution_rx) = mpsc::channel(capacity);
    let (decisions, mut decision_rx) = mpsc::channel(capacity);
    let (ticks, mut tick_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();

    let handle = EngineHandle {
        baselines,
        messages,
        executions: executions.clone(),
        decisions,
        ticks,
        status: engine.status_cell(),
        tracker: engine.tracker(),
        cancel: cancel.clone(),
    };

    let task = tokio::spawn(async move {
        let node = engine.own_index();
        info!(node, "Consensus engine started");
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(baseline) = baseline_rx.recv() => Event::NewBaseline(baseline),
                Some(completion) = execution_rx.recv() => Event::ExecutionComplete(completion),
                Some(decision) = decision_rx.recv() => Event::SubsetAgreed(decision),
                Some((sender, kind, payload)) = message_rx.recv() => Event::PeerMessage {
                    sender,
                    kind,
                    payload,
                },
                Some(()) = tick_rx.recv() => Event::TimerTick,
                else => break,
            };

            for task in engine.step(event, Instant::now()) {
                let executor = Arc::clone(&executor);
                let completions = executions.clone();
                tokio::spawn(async move {
                    let completion = task.run(executor.as_ref()).await;
                    if completions.send(completion).await.is_err() {
                        debug!(node, "Engine stopped before execution completed");
                    }
                });
            }
        }
        info!(node, "Consensus engine stopped");
    });

    (handle, task)
}

/// Sends a timer tick to `handle` every `period` until the engine stops.
pub fn spawn_ticker(handle: EngineHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = handle.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = handle.on_timer_tick() {
                        warn!(error = %e, "Stopping ticker");
                        break;
                    }
                }
            }
        }
    })
}

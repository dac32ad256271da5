//! Concord Consensus Engine
//!
//! Per-chain round state machine for a committee of `n` members tolerating
//! `f = (n - 1) / 3` Byzantine faults. Each confirmed baseline starts a
//! round that produces exactly one threshold-signed state transition.
//!
//! # Architecture
//!
//! - **Leader mode**: a deterministically scheduled leader collects
//!   readiness notifications, selects the batch every quorum of peers can
//!   execute and instructs the others. Stalled leaders are rotated away.
//! - **Common-subset mode**: every member proposes; an agreed subset of
//!   proposals fixes the batch, median timestamp and entropy.
//! - **Aggregation**: signature shares over the result essence are combined
//!   into one full signature and posted to the ledger.
//!
//! # Components
//!
//! - [`ConsensusEngine`]: synchronous state machine driven by [`Event`]s
//! - [`spawn_engine`]: tokio driver with bounded mailboxes
//! - [`LeaderScheduler`]: seeded leader order and rotation
//! - [`select_by_notifications`] and [`select_by_mentions`]: batch selection
//! - [`ResultAggregator`]: share collection and recovery
//! - [`Collaborators`]: transport, keys, ledger, request pool and subset
//!   agreement the engine is wired to
//!
//! # Round Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Subordinates │────▶│    Leader    │────▶│ Subordinates │
//! │   notify     │     │ selects batch│     │   execute    │
//! └──────────────┘     │  + params    │     └──────┬───────┘
//!                      └──────┬───────┘            │ signed result
//!                             │ execute            ▼
//!                             │            ┌──────────────┐
//!                             └───────────▶│  Aggregate   │
//!                                          │  (quorum)    │
//!                                          └──────┬───────┘
//!                                                 ▼
//!                      ┌──────────────────────────────────┐
//!                      │  Post to ledger, poll inclusion  │
//!                      └──────────────────────────────────┘
//! ```

mod aggregator;
mod batch;
mod collaborators;
mod config;
mod engine;
mod error;
mod leader;
mod message;
mod metrics;
mod params;
mod proposal;
mod round;
mod runner;
mod stage;
mod status;
mod transition;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use aggregator::{Contribution, ResultAggregator};
pub use batch::{
    batch_hash, select_by_mentions, select_by_notifications, select_ranked, Notifications,
    PeerSet,
};
pub use collaborators::{
    Collaborators, CommonSubset, ExecutionEngine, ExecutionInput, ExecutionOutput,
    InclusionState, KeyShare, LedgerClient, PeerTransport, RequestPool, SubsetDecision,
};
pub use config::{AgreementMode, EngineConfig};
pub use engine::{ConsensusEngine, Event, ExecutionCompletion, ExecutionTask, WallClock};
pub use error::{ConsensusError, Result};
pub use leader::LeaderScheduler;
pub use message::{
    MessageKind, NotifyRequests, PeerMessage, ResultPosted, SignedResult, StartProcessing,
};
pub use metrics::{ConsensusMetrics, DropLabels, NodeLabels};
pub use params::{agree_on_subset, leader_parameters, AgreedRound, RoundParameters};
pub use proposal::{BatchProposal, ProposalHints};
pub use round::Round;
pub use runner::{spawn_engine, spawn_ticker, EngineHandle};
pub use stage::{Path, Stage};
pub use status::{PendingCounts, RequestTracker, StatusCell, StatusSnapshot};
pub use transition::{ResultEssence, ResultState, StateTransition};

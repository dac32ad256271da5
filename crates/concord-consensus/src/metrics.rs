//! Prometheus metrics for consensus rounds.
//!
//! One [`ConsensusMetrics`] can be shared by several engines in a process;
//! every series carries the engine's committee index.

use concord_types::PeerIndex;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels identifying an engine.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeLabels {
    /// Committee index of the engine.
    pub node: u16,
}

/// Labels for dropped peer contributions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropLabels {
    /// Committee index of the engine.
    pub node: u16,
    /// Message kind.
    pub kind: String,
    /// Why it was dropped.
    pub reason: String,
}

/// Consensus metrics container.
#[derive(Clone, Debug)]
pub struct ConsensusMetrics {
    /// Rounds started.
    pub rounds_started: Family<NodeLabels, Counter>,
    /// Rounds abandoned because a newer baseline arrived.
    pub rounds_abandoned: Family<NodeLabels, Counter>,
    /// Leader rotations.
    pub rotations: Family<NodeLabels, Counter>,
    /// Rounds that fell back to common-subset agreement.
    pub subset_fallbacks: Family<NodeLabels, Counter>,
    /// Dropped peer messages and contributions.
    pub messages_dropped: Family<DropLabels, Counter>,
    /// Failed local executions.
    pub executions_failed: Family<NodeLabels, Counter>,
    /// Transitions finalized by this engine.
    pub transitions_finalized: Family<NodeLabels, Counter>,
    /// Transitions confirmed by the ledger.
    pub transitions_confirmed: Family<NodeLabels, Counter>,
    /// Transitions rejected by the ledger.
    pub transitions_rejected: Family<NodeLabels, Counter>,
    /// Time from round start to a finalized stage.
    pub round_duration_seconds: Family<NodeLabels, Histogram>,
    /// Baseline state index of the current round.
    pub baseline_index: Family<NodeLabels, Gauge>,
}

impl Default for ConsensusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsensusMetrics {
    /// Creates unregistered metrics.
    pub fn new() -> Self {
        Self {
            rounds_started: Family::default(),
            rounds_abandoned: Family::default(),
            rotations: Family::default(),
            subset_fallbacks: Family::default(),
            messages_dropped: Family::default(),
            executions_failed: Family::default(),
            transitions_finalized: Family::default(),
            transitions_confirmed: Family::default(),
            transitions_rejected: Family::default(),
            round_duration_seconds: Family::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 14))
            }),
            baseline_index: Family::default(),
        }
    }

    /// Registers every metric under the `concord_consensus` prefix.
    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("concord_consensus");
        registry.register(
            "rounds_started",
            "Rounds started",
            self.rounds_started.clone(),
        );
        registry.register(
            "rounds_abandoned",
            "Rounds superseded before finalization",
            self.rounds_abandoned.clone(),
        );
        registry.register("rotations", "Leader rotations", self.rotations.clone());
        registry.register(
            "subset_fallbacks",
            "Rounds switched to common-subset agreement",
            self.subset_fallbacks.clone(),
        );
        registry.register(
            "messages_dropped",
            "Dropped peer messages and contributions",
            self.messages_dropped.clone(),
        );
        registry.register(
            "executions_failed",
            "Failed local executions",
            self.executions_failed.clone(),
        );
        registry.register(
            "transitions_finalized",
            "State transitions finalized",
            self.transitions_finalized.clone(),
        );
        registry.register(
            "transitions_confirmed",
            "State transitions confirmed by the ledger",
            self.transitions_confirmed.clone(),
        );
        registry.register(
            "transitions_rejected",
            "State transitions rejected by the ledger",
            self.transitions_rejected.clone(),
        );
        registry.register(
            "round_duration_seconds",
            "Time from round start to finalization in seconds",
            self.round_duration_seconds.clone(),
        );
        registry.register(
            "baseline_index",
            "State index of the current baseline",
            self.baseline_index.clone(),
        );
    }

    pub(crate) fn node(node: PeerIndex) -> NodeLabels {
        NodeLabels { node }
    }

    pub(crate) fn dropped(&self, node: PeerIndex, kind: &str, reason: &str) {
        self.messages_dropped
            .get_or_create(&DropLabels {
                node,
                kind: kind.to_string(),
                reason: reason.to_string(),
            })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registered_metrics_are_encoded() {
        let metrics = ConsensusMetrics::new();
        let mut registry = Registry::default();
        metrics.register(&mut registry);

        metrics.rotations.get_or_create(&ConsensusMetrics::node(2)).inc();
        metrics.dropped(1, "signed_result", "invalid_share");

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("concord_consensus_rotations_total{node=\"2\"} 1"));
        assert!(out.contains("reason=\"invalid_share\""));
    }
}

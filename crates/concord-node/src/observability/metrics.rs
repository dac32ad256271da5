//! Prometheus metrics collection.

use concord_consensus::ConsensusMetrics;
use parking_lot::RwLock;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// HTTP request labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    /// HTTP method.
    pub method: String,
    /// Request path with member indexes collapsed.
    pub path: String,
    /// Response status code.
    pub status: u16,
}

/// Metrics state shared by the HTTP layer and every engine.
#[derive(Clone, Debug)]
pub struct MetricsState {
    /// Prometheus registry.
    pub registry: Arc<RwLock<Registry>>,
    /// Consensus series, handed to each engine.
    pub consensus: ConsensusMetrics,
    /// HTTP request counter.
    pub http_requests_total: Family<HttpLabels, Counter>,
    /// HTTP request duration histogram (seconds).
    pub http_request_duration_seconds: Family<HttpLabels, Histogram>,
    /// In-flight HTTP requests.
    pub http_active_connections: Gauge,
    /// Committee members currently running.
    pub committee_members_running: Gauge,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsState {
    /// Creates a registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let consensus = ConsensusMetrics::new();
        consensus.register(&mut registry);

        let http_requests_total = Family::<HttpLabels, Counter>::default();
        registry.register(
            "concord_http_requests",
            "Total HTTP requests",
            http_requests_total.clone(),
        );

        let http_request_duration_seconds =
            Family::<HttpLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 16))
            });
        registry.register(
            "concord_http_request_duration_seconds",
            "HTTP request duration in seconds",
            http_request_duration_seconds.clone(),
        );

        let http_active_connections = Gauge::default();
        registry.register(
            "concord_http_active_connections",
            "Number of in-flight HTTP requests",
            http_active_connections.clone(),
        );

        let committee_members_running = Gauge::default();
        registry.register(
            "concord_committee_members_running",
            "Committee members with a running engine",
            committee_members_running.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            consensus,
            http_requests_total,
            http_request_duration_seconds,
            http_active_connections,
            committee_members_running,
        }
    }

    /// Records a served HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let labels = HttpLabels {
            method: method.to_string(),
            path: normalize_path(path),
            status,
        };

        self.http_requests_total.get_or_create(&labels).inc();
        self.http_request_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Encodes every registered metric in the text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        let registry = self.registry.read();
        prometheus_client::encoding::text::encode(&mut buffer, &registry)?;
        Ok(buffer)
    }
}

/// Replaces numeric segments so per-member paths share one series.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|part| {
            if !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()) {
                ":param"
            } else {
                part
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/status"), "/status");
        assert_eq!(normalize_path("/status/3"), "/status/:param");
    }

    #[test]
    fn test_encode_includes_http_and_consensus_series() {
        let metrics = MetricsState::new();
        metrics.record_http_request("GET", "/status/1", 200, 0.001);
        metrics
            .consensus
            .rounds_started
            .get_or_create(&concord_consensus::NodeLabels { node: 0 })
            .inc();

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("concord_http_requests_total"));
        assert!(encoded.contains("path=\"/status/:param\""));
        assert!(encoded.contains("concord_consensus_rounds_started_total{node=\"0\"} 1"));
    }
}

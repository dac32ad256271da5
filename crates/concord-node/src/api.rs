//! HTTP surface: health, Prometheus metrics and engine status.

use crate::devnet::Member;
use crate::observability::{metrics_handler, metrics_middleware, MetricsState};
use axum::{
    extract::{FromRef, Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use concord_consensus::StatusSnapshot;
use concord_types::PeerIndex;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state of the HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Metrics registry.
    pub metrics: MetricsState,
    /// Committee members served by this node.
    pub members: Arc<Vec<Member>>,
}

impl FromRef<AppState> for MetricsState {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    committee_size: usize,
    members_running: usize,
}

#[derive(Debug, Serialize)]
struct MemberStatus {
    node: PeerIndex,
    running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<StatusSnapshot>,
    in_flight: usize,
}

impl MemberStatus {
    fn of(member: &Member) -> Self {
        match &member.handle {
            Some(handle) => Self {
                node: member.index,
                running: !handle.is_shutdown(),
                status: Some(handle.status_snapshot().as_ref().clone()),
                in_flight: handle.tracker().len(),
            },
            None => Self {
                node: member.index,
                running: false,
                status: None,
                in_flight: 0,
            },
        }
    }
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(committee_status))
        .route("/status/{node}", get(member_status))
        .layer(from_fn_with_state(state.metrics.clone(), metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    let members_running = state
        .members
        .iter()
        .filter(|m| m.handle.as_ref().is_some_and(|h| !h.is_shutdown()))
        .count();
    let health = Health {
        status: if members_running > 0 { "up" } else { "down" },
        committee_size: state.members.len(),
        members_running,
    };
    let code = if members_running > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health)).into_response()
}

async fn committee_status(State(state): State<AppState>) -> Json<Vec<MemberStatus>> {
    Json(state.members.iter().map(MemberStatus::of).collect())
}

async fn member_status(State(state): State<AppState>, Path(node): Path<PeerIndex>) -> Response {
    match state.members.get(usize::from(node)) {
        Some(member) => Json(MemberStatus::of(member)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            format!("no committee member {node}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::devnet::Devnet;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn spawn(offline: Vec<u16>) -> (Devnet, AppState) {
        let mut config = NodeConfig::default();
        config.devnet.request_interval_ms = 0;
        config.devnet.offline = offline;
        let metrics = MetricsState::new();
        let devnet = Devnet::spawn(&config, metrics.clone()).unwrap();
        let state = AppState {
            metrics,
            members: devnet.shared_members(),
        };
        (devnet, state)
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let (devnet, state) = spawn(vec![2]);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health = body_json(response).await;
        assert_eq!(health["committee_size"], 4);
        assert_eq!(health["members_running"], 3);

        let response = app
            .clone()
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = body_json(response).await;
        assert_eq!(status.as_array().unwrap().len(), 4);
        assert_eq!(status[0]["status"]["stage"], "idle");
        assert_eq!(status[2]["running"], false);
        assert!(status[2].get("status").is_none());

        let response = app
            .clone()
            .oneshot(Request::get("/status/1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["node"], 1);

        let response = app
            .oneshot(Request::get("/status/9").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        devnet.shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_endpoint_counts_requests() {
        let (devnet, state) = spawn(Vec::new());
        let app = router(state);

        let _ = app
            .clone()
            .oneshot(Request::get("/status/0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4; charset=utf-8"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("path=\"/status/:param\""));
        assert!(text.contains("concord_committee_members_running 4"));

        devnet.shutdown().await;
    }
}

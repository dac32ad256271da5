//! # Observability
//!
//! Logging and metrics for a Concord node:
//!
//! - **Structured logging**: pretty or JSON output through `tracing`
//! - **Prometheus metrics**: HTTP request series plus every consensus
//!   series, encoded from one registry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use axum::middleware::from_fn_with_state;
//! use concord_node::observability::{init_logging, metrics_middleware, MetricsState};
//!
//! init_logging("info", false);
//! let metrics = MetricsState::new();
//! let app = axum::Router::new()
//!     .layer(from_fn_with_state(metrics.clone(), metrics_middleware));
//! ```

mod logging;
mod metrics;
mod middleware;

pub use logging::{init_logging, LogFormat};
pub use metrics::{HttpLabels, MetricsState};
pub use middleware::{metrics_handler, metrics_middleware};

//! # Concord Node
//!
//! Runs a committee of Concord consensus engines in one process and serves
//! their status and metrics over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Concord Node                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  HTTP: /health  /metrics  /status  /status/{node}           │
//! │                              │                              │
//! │  Devnet committee                                           │
//! │  • one engine task + ticker per member                      │
//! │  • router: messages, subset decisions, new baselines        │
//! │  • request generator                                        │
//! │                              │                              │
//! │  In-memory network, ledger, request pools                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! concord-node run --config concord.yaml
//! concord-node config --config concord.yaml
//! ```
//!
//! ## Modules
//!
//! - `api` - HTTP router (feature `devnet`)
//! - [`config`] - Layered node configuration
//! - `devnet` - In-process committee (feature `devnet`)
//! - [`observability`] - Logging and Prometheus metrics

#[cfg(feature = "devnet")]
pub mod api;
pub mod config;
#[cfg(feature = "devnet")]
pub mod devnet;
pub mod observability;

#[cfg(feature = "devnet")]
pub use api::{router, AppState};
pub use config::{ConfigError, DevnetConfig, NodeConfig};
#[cfg(feature = "devnet")]
pub use devnet::{devnet_genesis, Devnet, Member};

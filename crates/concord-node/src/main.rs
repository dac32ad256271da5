//! Concord Node - runs a local consensus committee.

use anyhow::Context;
use clap::{Parser, Subcommand};
use concord_node::observability::{init_logging, MetricsState};
use concord_node::{devnet_genesis, router, AppState, Devnet, NodeConfig};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Concord Node - committee consensus for chain state transitions
#[derive(Parser, Debug)]
#[command(name = "concord-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "concord.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the committee and the HTTP server (default)
    Run {
        /// API listen address, overrides the configuration
        #[arg(long)]
        api_addr: Option<SocketAddr>,

        /// Log level (trace, debug, info, warn, error)
        #[arg(long)]
        log_level: Option<String>,

        /// Emit JSON logs
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = NodeConfig::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command.unwrap_or(Command::Run {
        api_addr: None,
        log_level: None,
        json: false,
    }) {
        Command::Config => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
        Command::Run {
            api_addr,
            log_level,
            json,
        } => {
            if let Some(addr) = api_addr {
                config.api_addr = addr;
            }
            if let Some(level) = log_level {
                config.log_level = level;
            }
            config.log_json |= json;
            run(config).await
        }
    }
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    init_logging(&config.log_level, config.log_json);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Concord node");
    tracing::info!(
        api_addr = %config.api_addr,
        committee_size = config.devnet.committee_size,
        mode = config.engine.initial_mode.as_str(),
        "Node configuration"
    );

    let metrics = MetricsState::new();
    let devnet = Devnet::spawn(&config, metrics.clone()).context("spawning committee")?;
    devnet
        .start(devnet_genesis())
        .await
        .context("delivering genesis baseline")?;

    let app = router(AppState {
        metrics,
        members: devnet.shared_members(),
    });
    let listener = tokio::net::TcpListener::bind(config.api_addr)
        .await
        .with_context(|| format!("binding {}", config.api_addr))?;
    tracing::info!(addr = %config.api_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
        })
        .await
        .context("serving HTTP")?;

    devnet.shutdown().await;
    tracing::info!("Concord node stopped");
    Ok(())
}

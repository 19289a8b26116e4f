// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Barter Node
//!
//! Entry point for the `barter-node` binary. Parses CLI arguments, sets up
//! logging and metrics, opens the store, starts the node, and serves
//! `/metrics` and `/status` until Ctrl-C or SIGTERM.
//!
//! - `run`    : start the node
//! - `version`: print build version information

mod cli;
mod logging;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use barter_protocol::storage::{MemoryStore, SledStore, Store};
use barter_protocol::{BarterNode, NodeConfig};

use cli::{BarterNodeCli, Commands};
use metrics::{HttpState, NodeMetrics};

/// How often the gauges are refreshed between scrapes.
const METRICS_REFRESH: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = BarterNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn node_config(args: &cli::RunArgs) -> NodeConfig {
    let mut config = NodeConfig {
        bind_host: args.bind_host.clone(),
        peers: args.peers.clone(),
        stake: args.stake,
        ..NodeConfig::default()
    };
    config.gossip.port = args.p2p_port;
    config.gossip.advertised_host = args.advertised_host.clone();
    config.producer.block_interval = Duration::from_secs(args.block_interval.max(1));
    config
}

fn open_store(args: &cli::RunArgs) -> Result<Arc<dyn Store>> {
    if args.in_memory {
        tracing::warn!("using in-memory store, nothing survives a restart");
        return Ok(Arc::new(MemoryStore::new()));
    }
    std::fs::create_dir_all(&args.data_dir).with_context(|| {
        format!("failed to create data directory: {}", args.data_dir.display())
    })?;
    let store = SledStore::open(&args.data_dir)
        .with_context(|| format!("failed to open database at {}", args.data_dir.display()))?;
    tracing::info!(path = %args.data_dir.display(), "database opened");
    Ok(Arc::new(store))
}

async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging("barter_node=info,barter_protocol=info", args.log_format.into());

    tracing::info!(
        p2p_port = args.p2p_port,
        metrics_port = args.metrics_port,
        peers = args.peers.len(),
        "starting barter-node"
    );

    let store = open_store(&args)?;
    let node = BarterNode::new(node_config(&args), store);
    let addr = node
        .start()
        .await
        .with_context(|| format!("failed to start peer listener on port {}", args.p2p_port))?;
    tracing::info!(node = %node.id(), addr = %addr, "node running");

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    let refresh = {
        let metrics = Arc::clone(&node_metrics);
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_REFRESH);
            loop {
                interval.tick().await;
                metrics.observe(&node.status());
            }
        })
    };

    let http = metrics::router(HttpState {
        metrics: Arc::clone(&node_metrics),
        node: Arc::clone(&node),
    });
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!(addr = %metrics_addr, "metrics server listening");

    // --- Serve ---
    tokio::select! {
        res = axum::serve(metrics_listener, http) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown signal received");
        }
    }

    refresh.abort();
    node.shutdown().await;
    tracing::info!("barter-node stopped");
    Ok(())
}

fn print_version() {
    println!("barter-node {}", env!("CARGO_PKG_VERSION"));
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            res = signal::ctrl_c() => res.context("failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")
    }
}

//! # CLI Interface
//!
//! Command-line arguments for `barter-node`, via `clap` derive. Every `run`
//! flag can also be set through a `BARTER_*` environment variable.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use barter_protocol::config;

/// Barter ledger peer node.
///
/// Joins the gossip network, keeps a copy of the barter ledger, owns two
/// item shards, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "barter-node",
    about = "Barter ledger peer node",
    version,
    propagate_version = true
)]
pub struct BarterNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Port for peer-to-peer traffic. `0` picks a free port.
    #[arg(long, env = "BARTER_P2P_PORT", default_value_t = config::DEFAULT_P2P_PORT)]
    pub p2p_port: u16,

    /// Interface the peer listener binds to.
    #[arg(long, env = "BARTER_BIND_HOST", default_value = config::DEFAULT_BIND_HOST)]
    pub bind_host: String,

    /// Host announced to peers in the handshake.
    #[arg(long, env = "BARTER_ADVERTISED_HOST", default_value = config::DEFAULT_ADVERTISED_HOST)]
    pub advertised_host: String,

    /// Peers to dial at start, as `host:port`.
    #[arg(long, env = "BARTER_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Stake this node registers for itself.
    #[arg(long, env = "BARTER_STAKE", default_value_t = config::DEFAULT_VALIDATOR_STAKE)]
    pub stake: u64,

    /// Directory of the sled database.
    #[arg(long, short = 'd', env = "BARTER_DATA_DIR", default_value = "./barter-data")]
    pub data_dir: PathBuf,

    /// Keep all records in memory instead of on disk.
    #[arg(long, env = "BARTER_IN_MEMORY", conflicts_with = "data_dir")]
    pub in_memory: bool,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "BARTER_METRICS_PORT", default_value_t = config::DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Seconds between block production rounds.
    #[arg(long, env = "BARTER_BLOCK_INTERVAL", default_value_t = config::BLOCK_INTERVAL.as_secs())]
    pub block_interval: u64,

    #[arg(long, env = "BARTER_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        BarterNodeCli::command().debug_assert();
    }

    #[test]
    fn peers_split_on_commas() {
        let cli = BarterNodeCli::parse_from([
            "barter-node",
            "run",
            "--in-memory",
            "--peers",
            "10.0.0.1:6001,10.0.0.2:6001",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.peers, vec!["10.0.0.1:6001", "10.0.0.2:6001"]);
        assert!(args.in_memory);
        assert_eq!(args.p2p_port, config::DEFAULT_P2P_PORT);
    }
}

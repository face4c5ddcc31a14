//! CLI and config handling.

use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_BATCH_WORKERS: usize = 4;
pub const DEFAULT_MIN_PEERS: usize = 1;

/// Block synchronization node configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "blocksync-node", about = "Peer-driven block synchronization node")]
pub struct NodeConfig {
    /// Per-block inactivity timeout for peer block streams, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_BLOCK_TIMEOUT_MS)]
    pub block_timeout_ms: u64,
    /// Number of concurrent batch fetch workers.
    #[arg(long, default_value_t = DEFAULT_BATCH_WORKERS)]
    pub batch_workers: usize,
    /// Minimum connected peers before sync starts.
    #[arg(long, default_value_t = DEFAULT_MIN_PEERS)]
    pub min_peers: usize,
    /// Catch up through the batch queue before streaming.
    #[arg(long)]
    pub batch_sync: bool,
    /// Exit after the initial catch-up instead of following the tip.
    #[arg(long)]
    pub bulk_only: bool,
    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbosity: u8,
}

impl NodeConfig {
    /// Parse configuration from CLI args.
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = NodeConfig::parse_from(["blocksync-node"]);

        assert_eq!(config.block_timeout_ms, DEFAULT_BLOCK_TIMEOUT_MS);
        assert_eq!(config.batch_workers, DEFAULT_BATCH_WORKERS);
        assert_eq!(config.min_peers, DEFAULT_MIN_PEERS);
        assert!(!config.batch_sync);
        assert!(!config.bulk_only);
        assert_eq!(config.verbosity, 0);
        assert_eq!(config.block_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn verbosity_accumulates() {
        let config = NodeConfig::parse_from(["blocksync-node", "-vv"]);
        assert_eq!(config.verbosity, 2);
    }
}

mod chain;
mod cli;
mod logging;
mod p2p;
mod progress;
mod sync;
#[cfg(test)]
mod test_utils;

use chain::{Blockchain, MemoryChain};
use cli::NodeConfig;
use eyre::Result;
use progress::ProgressionTracker;
use reth_chainspec::MAINNET;
use std::sync::Arc;
use sync::{BatchSync, SyncError, Syncer};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_args();
    logging::init_tracing(config.verbosity);

    info!(
        block_timeout_ms = config.block_timeout_ms,
        batch_workers = config.batch_workers,
        min_peers = config.min_peers,
        "starting blocksync node"
    );

    let client = Arc::new(p2p::connect_mainnet(config.min_peers).await?);
    let chain = Arc::new(MemoryChain::new(MAINNET.genesis_header().clone()));
    let progression = Arc::new(ProgressionTracker::new());
    let syncer = Syncer::new(
        Arc::clone(&chain),
        Arc::clone(&client),
        progression.clone(),
        config.block_timeout(),
    );
    syncer.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    if config.batch_sync {
        if let Some(best) = syncer.peer_map().best_peer(chain.header().number) {
            info!(target = best.number, "batch syncing through the queue");
            let pipeline = BatchSync::new(
                Arc::clone(&chain),
                Arc::clone(&client),
                Arc::clone(syncer.peer_map()),
                config.batch_workers,
            );
            match pipeline.run(shutdown_rx.clone(), best.number).await {
                Ok(last) => info!(last, "batch sync complete"),
                Err(SyncError::Cancelled) => {
                    info!("shutdown requested");
                    return Ok(());
                }
                Err(err) => warn!(error = %err, "batch sync stopped"),
            }
        }
    }

    match syncer
        .bulk_sync(shutdown_rx.clone(), |block| {
            if block.header.number % 1000 == 0 {
                info!(number = block.header.number, "synced block");
            }
            false
        })
        .await
    {
        Ok(()) => info!(local = chain.header().number, "bulk sync complete"),
        Err(SyncError::Cancelled) => {
            info!("shutdown requested");
            return Ok(());
        }
        Err(err) => warn!(error = %err, "bulk sync stopped"),
    }

    if config.bulk_only {
        return Ok(());
    }

    info!("watching for new peer statuses");
    match syncer.watch_sync(shutdown_rx, |_block| false).await {
        Ok(()) | Err(SyncError::Cancelled) => {}
        Err(err) => warn!(error = %err, "watch sync stopped"),
    }
    Ok(())
}

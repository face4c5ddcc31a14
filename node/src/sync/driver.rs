//! Peer-driven sync driver.

use crate::chain::Blockchain;
use crate::p2p::{NoForkPeer, PeerEvent, SyncPeerClient};
use crate::progress::Progression;
use crate::sync::peers::PeerMap;
use crate::sync::SyncError;
use eyre::Result;
use reth_ethereum_primitives::Block;
use reth_network_api::PeerId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Result of streaming blocks from a single peer.
#[derive(Debug)]
pub struct PeerSyncOutcome {
    /// Highest block written during this stream.
    pub last_synced: u64,
    /// The block callback requested termination.
    pub terminated: bool,
    /// Why the stream stopped early, if it did.
    pub error: Option<SyncError>,
}

/// Two-mode block sync driver.
///
/// `bulk_sync` catches up from the best available peers, abandoning a peer on
/// any failure and moving to the next; `watch_sync` follows new peer statuses
/// at steady state. Both write blocks in strictly increasing order and honor
/// shutdown at every suspension point.
pub struct Syncer<B, C> {
    blockchain: Arc<B>,
    client: Arc<C>,
    peer_map: Arc<PeerMap>,
    progression: Arc<dyn Progression>,
    block_timeout: Duration,
}

impl<B: Blockchain, C: SyncPeerClient> Syncer<B, C> {
    pub fn new(
        blockchain: Arc<B>,
        client: Arc<C>,
        progression: Arc<dyn Progression>,
        block_timeout: Duration,
    ) -> Self {
        Self {
            blockchain,
            client,
            peer_map: Arc::new(PeerMap::new()),
            progression,
            block_timeout,
        }
    }

    pub fn peer_map(&self) -> &Arc<PeerMap> {
        &self.peer_map
    }

    /// Start the transport and the peer lifecycle tasks.
    pub async fn start(&self) -> Result<()> {
        self.client.start().await?;
        let status_rx = self.client.subscribe_status_updates();
        let event_rx = self.client.subscribe_peer_events();
        self.initialize_peer_map().await;
        tokio::spawn(run_status_update_process(
            Arc::clone(&self.peer_map),
            status_rx,
        ));
        tokio::spawn(run_peer_event_process(
            Arc::clone(&self.peer_map),
            Arc::clone(&self.client),
            event_rx,
        ));
        Ok(())
    }

    pub(crate) async fn initialize_peer_map(&self) {
        let statuses = self.client.connected_peer_statuses().await;
        self.peer_map.put_peers(statuses);
    }

    /// Catch up with the best available peers until none is ahead of us.
    ///
    /// Per-peer failures discard that peer for this run and move on; only
    /// shutdown aborts the loop with an error.
    pub async fn bulk_sync<F>(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut callback: F,
    ) -> Result<(), SyncError>
    where
        F: FnMut(&Block) -> bool,
    {
        let local = self.blockchain.header().number;
        self.progression
            .start_progression(local + 1, self.blockchain.subscribe_events());
        let result = self.bulk_sync_loop(&mut shutdown, &mut callback).await;
        self.progression.stop_progression();
        result
    }

    async fn bulk_sync_loop<F>(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        callback: &mut F,
    ) -> Result<(), SyncError>
    where
        F: FnMut(&Block) -> bool,
    {
        let mut failed: HashSet<PeerId> = HashSet::new();
        loop {
            if *shutdown.borrow() {
                return Err(SyncError::Cancelled);
            }
            let local = self.blockchain.header().number;
            let Some(peer) = self.peer_map.best_peer_excluding(local, &failed) else {
                return Ok(());
            };
            self.progression.update_highest_progression(peer.number);
            debug!(peer_id = ?peer.id, number = peer.number, local, "bulk syncing with peer");

            let outcome = self.bulk_sync_with_peer(peer.id, shutdown, callback).await;
            if let Some(error) = outcome.error {
                if matches!(error, SyncError::Cancelled) {
                    return Err(SyncError::Cancelled);
                }
                warn!(
                    peer_id = ?peer.id,
                    error = %error,
                    last_synced = outcome.last_synced,
                    "sync with peer stopped; trying another"
                );
                failed.insert(peer.id);
            }
            if outcome.terminated {
                return Ok(());
            }
        }
    }

    /// Follow new peer statuses and sync whenever a peer gets ahead of us.
    ///
    /// Returns once the block callback requests termination; per-peer
    /// failures leave the loop running.
    pub async fn watch_sync<F>(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut callback: F,
    ) -> Result<(), SyncError>
    where
        F: FnMut(&Block) -> bool,
    {
        loop {
            tokio::select! {
                _ = self.peer_map.new_status().notified() => {}
                _ = wait_cancelled(&mut shutdown) => return Err(SyncError::Cancelled),
            }

            let local = self.blockchain.header().number;
            let Some(best) = self.peer_map.best_peer(local) else {
                continue;
            };
            let outcome = self
                .bulk_sync_with_peer(best.id, &mut shutdown, &mut callback)
                .await;
            match outcome.error {
                Some(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Some(error) => {
                    warn!(peer_id = ?best.id, error = %error, "watch sync with peer stopped");
                    continue;
                }
                None => {}
            }
            if outcome.terminated {
                return Ok(());
            }
        }
    }

    /// Stream blocks from one peer starting past the local tip, verifying and
    /// writing each in order. The callback runs exactly once per written
    /// block; returning `true` terminates the stream.
    pub(crate) async fn bulk_sync_with_peer<F>(
        &self,
        peer_id: PeerId,
        shutdown: &mut watch::Receiver<bool>,
        callback: &mut F,
    ) -> PeerSyncOutcome
    where
        F: FnMut(&Block) -> bool,
    {
        let local = self.blockchain.header().number;
        let mut stream = match self.client.open_block_stream(peer_id, local + 1).await {
            Ok(stream) => stream,
            Err(err) => {
                return PeerSyncOutcome {
                    last_synced: local,
                    terminated: false,
                    error: Some(SyncError::Peer(err)),
                }
            }
        };

        let mut last_synced = local;
        let mut terminated = false;
        let mut error = None;
        loop {
            // the idle window restarts on every received block
            let received = tokio::select! {
                received = timeout(self.block_timeout, stream.recv()) => received,
                _ = wait_cancelled(shutdown) => {
                    error = Some(SyncError::Cancelled);
                    break;
                }
            };
            let block = match received {
                Err(_) => {
                    error = Some(SyncError::Timeout);
                    break;
                }
                Ok(None) => break,
                Ok(Some(block)) => block,
            };

            if let Err(err) = self.blockchain.verify_finalized_block(&block) {
                error = Some(SyncError::Verify(err));
                break;
            }
            if let Err(err) = self.blockchain.write_block(&block) {
                error = Some(SyncError::Write(err));
                break;
            }
            last_synced = block.header.number;

            if callback(&block) {
                terminated = true;
                break;
            }
        }

        stream.close();
        if let Err(err) = self.client.close_stream(peer_id).await {
            debug!(peer_id = ?peer_id, error = %err, "failed to close block stream");
        }
        PeerSyncOutcome {
            last_synced,
            terminated,
            error,
        }
    }
}

/// Feed status updates from the transport into the registry.
pub(crate) async fn run_status_update_process(
    peer_map: Arc<PeerMap>,
    mut rx: mpsc::UnboundedReceiver<NoForkPeer>,
) {
    while let Some(status) = rx.recv().await {
        peer_map.put(status);
    }
}

/// Maintain the registry from peer connection lifecycle events.
pub(crate) async fn run_peer_event_process<C: SyncPeerClient>(
    peer_map: Arc<PeerMap>,
    client: Arc<C>,
    mut rx: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            PeerEvent::Connected(peer_id) => match client.peer_status(peer_id).await {
                Ok(status) => peer_map.put(status),
                Err(err) => {
                    debug!(peer_id = ?peer_id, error = %err, "no status for connected peer")
                }
            },
            PeerEvent::Disconnected(peer_id) => peer_map.remove(&peer_id),
            PeerEvent::FailedToConnect(_)
            | PeerEvent::DialCompleted(_)
            | PeerEvent::AddedToDialQueue(_) => {}
        }
    }
}

async fn wait_cancelled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            // sender gone; shutdown can no longer fire
            std::future::pending::<()>().await;
        }
    }
}

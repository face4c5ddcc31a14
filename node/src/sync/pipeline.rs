//! Queue-driven batch sync pipeline.

use crate::chain::Blockchain;
use crate::p2p::{NoForkPeer, SyncPeerClient};
use crate::sync::peers::PeerMap;
use crate::sync::queue::{BatchQueue, Job, JobKind, MAX_BATCH};
use crate::sync::SyncError;
use alloy_primitives::B256;
use reth_network_api::PeerId;
use reth_primitives_traits::SealedHeader;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How long an idle worker waits before polling the queue again.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(25);
/// How often the drain loop harvests completed batches.
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Queue-driven batch synchronizer for a bounded height range.
///
/// Fetch workers pull jobs off the queue and execute them against rotating
/// peers; a drain loop harvests completed batches and installs their blocks
/// in canonical order.
pub struct BatchSync<B, C> {
    blockchain: Arc<B>,
    client: Arc<C>,
    peer_map: Arc<PeerMap>,
    workers: usize,
}

impl<B: Blockchain, C: SyncPeerClient> BatchSync<B, C> {
    pub fn new(
        blockchain: Arc<B>,
        client: Arc<C>,
        peer_map: Arc<PeerMap>,
        workers: usize,
    ) -> Self {
        Self {
            blockchain,
            client,
            peer_map,
            workers: workers.max(1),
        }
    }

    /// Fetch and install blocks `local + 1 ..= target`. Returns the highest
    /// block written.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        target: u64,
    ) -> Result<u64, SyncError> {
        let tip = self.blockchain.header();
        let local = tip.number;
        if target <= local {
            return Ok(local);
        }

        let queue = Arc::new(BatchQueue::new(tip.hash_slow()));
        let mut block = local + 1;
        while block <= target {
            queue.add_back(block);
            block += MAX_BATCH;
        }
        // terminal boundary fixes the length of the last real batch
        queue.add_back(target + 1);

        let (stop_tx, stop_rx) = watch::channel(false);
        let cursor = Arc::new(AtomicUsize::new(0));
        let mut workers: JoinSet<()> = JoinSet::new();
        for _ in 0..self.workers {
            let queue = Arc::clone(&queue);
            let client = Arc::clone(&self.client);
            let peer_map = Arc::clone(&self.peer_map);
            let cursor = Arc::clone(&cursor);
            let mut stop_rx = stop_rx.clone();
            workers.spawn(async move {
                run_fetch_worker(queue, client, peer_map, cursor, target, &mut stop_rx).await;
            });
        }

        let result = self.drain_loop(&queue, &mut shutdown, target).await;
        let _ = stop_tx.send(true);
        while workers.join_next().await.is_some() {}
        result
    }

    async fn drain_loop(
        &self,
        queue: &BatchQueue,
        shutdown: &mut watch::Receiver<bool>,
        target: u64,
    ) -> Result<u64, SyncError> {
        let mut last_written = self.blockchain.header().number;
        loop {
            if *shutdown.borrow() {
                return Err(SyncError::Cancelled);
            }
            let completed = queue.num_completed_batches();
            if completed > 0 {
                debug!(completed, last_written, "harvesting completed batches");
            }
            for batch in queue.fetch_completed_data() {
                for block in batch.into_blocks() {
                    self.blockchain
                        .verify_finalized_block(&block)
                        .map_err(SyncError::Verify)?;
                    self.blockchain
                        .write_block(&block)
                        .map_err(SyncError::Write)?;
                    last_written = block.header.number;
                }
            }
            if last_written >= target {
                return Ok(last_written);
            }
            tokio::select! {
                _ = sleep(DRAIN_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

async fn run_fetch_worker<C: SyncPeerClient>(
    queue: Arc<BatchQueue>,
    client: Arc<C>,
    peer_map: Arc<PeerMap>,
    cursor: Arc<AtomicUsize>,
    target: u64,
    stop_rx: &mut watch::Receiver<bool>,
) {
    while !*stop_rx.borrow() {
        let Some(job) = queue.dequeue_below(target + 1) else {
            idle(stop_rx).await;
            continue;
        };
        let Some(peer) = next_peer(&peer_map, &cursor) else {
            // nobody to ask; reopen the slot and wait for peers
            requeue(&queue, &job);
            idle(stop_rx).await;
            continue;
        };
        if let Err(err) = execute_job(&queue, client.as_ref(), peer.id, &job, target).await {
            warn!(
                peer_id = ?peer.id,
                batch_id = job.batch_id,
                error = %err,
                "batch job failed; requeueing"
            );
            requeue(&queue, &job);
        }
    }
}

async fn idle(stop_rx: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = sleep(WORKER_IDLE_WAIT) => {}
        _ = stop_rx.changed() => {}
    }
}

fn next_peer(peer_map: &PeerMap, cursor: &AtomicUsize) -> Option<NoForkPeer> {
    let mut peers = Vec::new();
    peer_map.range(|peer| {
        peers.push(peer.clone());
        true
    });
    if peers.is_empty() {
        return None;
    }
    let idx = cursor.fetch_add(1, Ordering::Relaxed) % peers.len();
    Some(peers.swap_remove(idx))
}

/// Reopen the job's slot; an empty delivery puts the track back to waiting.
fn requeue(queue: &BatchQueue, job: &Job) {
    let result = match job.kind {
        JobKind::Headers { .. } => queue.deliver_headers(job.batch_id, Vec::new()),
        JobKind::Bodies { .. } => queue.deliver_bodies(job.batch_id, Vec::new()),
        JobKind::Receipts { .. } => queue.deliver_receipts(job.batch_id, Vec::new()),
    };
    if let Err(err) = result {
        debug!(batch_id = job.batch_id, error = %err, "failed to requeue job");
    }
}

async fn execute_job<C: SyncPeerClient>(
    queue: &BatchQueue,
    client: &C,
    peer_id: PeerId,
    job: &Job,
    target: u64,
) -> eyre::Result<()> {
    match &job.kind {
        JobKind::Headers { start, count } => {
            let count = (*count).min(target.saturating_sub(*start) + 1);
            let headers = client.request_headers(peer_id, *start, count).await?;
            // seal outside the queue lock
            let sealed: Vec<SealedHeader> =
                headers.into_iter().map(SealedHeader::seal_slow).collect();
            queue.deliver_headers(job.batch_id, sealed)?;
        }
        JobKind::Bodies { headers } => {
            let hashes: Vec<B256> = headers.iter().map(SealedHeader::hash).collect();
            let bodies = client.request_bodies(peer_id, &hashes).await?;
            queue.deliver_bodies(job.batch_id, bodies)?;
        }
        JobKind::Receipts { headers } => {
            let hashes: Vec<B256> = headers.iter().map(SealedHeader::hash).collect();
            let receipts = client.request_receipts(peer_id, &hashes).await?;
            queue.deliver_receipts(job.batch_id, receipts)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::p2p::{BlockStream, PeerEvent};
    use crate::test_utils::{empty_header, linked_payloads, Payload};
    use alloy_primitives::U256;
    use async_trait::async_trait;
    use eyre::{eyre, Result};
    use parking_lot::Mutex;
    use reth_ethereum_primitives::{BlockBody, Receipt};
    use reth_primitives_traits::Header;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::mpsc;

    /// Serves a prebuilt payload chain over the batch RPCs.
    struct MockBatchClient {
        by_number: HashMap<u64, Payload>,
        by_hash: HashMap<B256, Payload>,
        header_failures: AtomicU64,
        requests: Mutex<Vec<(u64, u64)>>,
    }

    impl MockBatchClient {
        fn new(payloads: Vec<Payload>, header_failures: u64) -> Self {
            let by_number = payloads
                .iter()
                .map(|payload| (payload.header.header().number, payload.clone()))
                .collect();
            let by_hash = payloads
                .into_iter()
                .map(|payload| (payload.header.hash(), payload))
                .collect();
            Self {
                by_number,
                by_hash,
                header_failures: AtomicU64::new(header_failures),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SyncPeerClient for MockBatchClient {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        fn close(&self) {}

        async fn peer_status(&self, peer_id: PeerId) -> Result<NoForkPeer> {
            Err(eyre!("no status for {peer_id:?}"))
        }

        async fn connected_peer_statuses(&self) -> Vec<NoForkPeer> {
            Vec::new()
        }

        async fn open_block_stream(&self, _peer_id: PeerId, _start: u64) -> Result<BlockStream> {
            Err(eyre!("streams not served"))
        }

        async fn close_stream(&self, _peer_id: PeerId) -> Result<()> {
            Ok(())
        }

        fn subscribe_status_updates(&self) -> mpsc::UnboundedReceiver<NoForkPeer> {
            mpsc::unbounded_channel().1
        }

        fn subscribe_peer_events(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
            mpsc::unbounded_channel().1
        }

        async fn request_headers(
            &self,
            _peer_id: PeerId,
            start: u64,
            count: u64,
        ) -> Result<Vec<Header>> {
            if self.header_failures.load(Ordering::SeqCst) > 0 {
                self.header_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(eyre!("peer dropped the request"));
            }
            self.requests.lock().push((start, count));
            let mut headers = Vec::new();
            for number in start..start + count {
                match self.by_number.get(&number) {
                    Some(payload) => headers.push(payload.header.header().clone()),
                    None => break,
                }
            }
            Ok(headers)
        }

        async fn request_bodies(&self, _peer_id: PeerId, hashes: &[B256]) -> Result<Vec<BlockBody>> {
            Ok(hashes
                .iter()
                .filter_map(|hash| self.by_hash.get(hash).map(|p| p.body.clone()))
                .collect())
        }

        async fn request_receipts(
            &self,
            _peer_id: PeerId,
            hashes: &[B256],
        ) -> Result<Vec<Vec<Receipt>>> {
            Ok(hashes
                .iter()
                .filter_map(|hash| self.by_hash.get(hash).map(|p| p.receipts.clone()))
                .collect())
        }
    }

    fn peer_map_with(peers: u8, number: u64) -> Arc<PeerMap> {
        let map = PeerMap::new();
        for tag in 1..=peers {
            map.put(NoForkPeer {
                id: PeerId::repeat_byte(tag),
                number,
                distance: U256::from(tag),
            });
        }
        Arc::new(map)
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn syncs_a_bounded_range_through_the_queue() {
        let chain = Arc::new(MemoryChain::new(empty_header(0, B256::ZERO)));
        let payloads = linked_payloads(1, 250, chain.tip_hash());
        let client = Arc::new(MockBatchClient::new(payloads, 0));

        let pipeline = BatchSync::new(
            Arc::clone(&chain),
            Arc::clone(&client),
            peer_map_with(2, 250),
            2,
        );
        let last = pipeline
            .run(no_shutdown(), 250)
            .await
            .expect("pipeline completes");

        assert_eq!(last, 250);
        assert_eq!(chain.header().number, 250);
        assert!(chain.get_block_by_number(250, true).is_some());
        // the final short batch was clipped to the target, never past it
        let requests = client.requests.lock().clone();
        assert!(requests.iter().all(|(start, count)| start + count <= 251));
    }

    #[tokio::test]
    async fn recovers_from_transient_fetch_failures() {
        let chain = Arc::new(MemoryChain::new(empty_header(0, B256::ZERO)));
        let payloads = linked_payloads(1, 120, chain.tip_hash());
        // the first three header requests fail before the peer behaves
        let client = Arc::new(MockBatchClient::new(payloads, 3));

        let pipeline = BatchSync::new(
            Arc::clone(&chain),
            Arc::clone(&client),
            peer_map_with(1, 120),
            2,
        );
        let last = pipeline
            .run(no_shutdown(), 120)
            .await
            .expect("pipeline completes");

        assert_eq!(last, 120);
        assert_eq!(chain.header().number, 120);
    }

    #[tokio::test]
    async fn already_synced_target_is_a_noop() {
        let chain = Arc::new(MemoryChain::new(empty_header(5, B256::ZERO)));
        let client = Arc::new(MockBatchClient::new(Vec::new(), 0));
        let pipeline = BatchSync::new(Arc::clone(&chain), client, peer_map_with(1, 5), 2);
        let last = pipeline.run(no_shutdown(), 5).await.expect("no work");
        assert_eq!(last, 5);
    }

    #[tokio::test]
    async fn shutdown_cancels_the_pipeline() {
        let chain = Arc::new(MemoryChain::new(empty_header(0, B256::ZERO)));
        let client = Arc::new(MockBatchClient::new(Vec::new(), 0));
        let pipeline = BatchSync::new(Arc::clone(&chain), client, peer_map_with(1, 100), 1);
        let (tx, rx) = watch::channel(true);
        drop(tx);
        let err = pipeline
            .run(rx, 100)
            .await
            .expect_err("must be cancelled");
        assert!(matches!(err, SyncError::Cancelled));
    }
}

//! P2P transport surface consumed by the sync core.

use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use eyre::Result;
use reth_ethereum_primitives::{Block, BlockBody, Receipt};
use reth_network_api::PeerId;
use reth_primitives_traits::Header;
use tokio::sync::mpsc;

mod network;

pub use network::{connect_mainnet, NetworkClient};

/// Capacity of the channel backing a block stream.
pub const BLOCK_STREAM_BUFFER: usize = 64;

/// Advertised status of a peer assumed to share our chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoForkPeer {
    pub id: PeerId,
    /// Highest block the peer advertises.
    pub number: u64,
    /// Opaque ordering key; larger wins when `number` ties.
    pub distance: U256,
}

impl NoForkPeer {
    pub fn is_better(&self, other: &NoForkPeer) -> bool {
        if self.number != other.number {
            return self.number > other.number;
        }
        self.distance > other.distance
    }
}

/// Connection lifecycle events surfaced by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    FailedToConnect(PeerId),
    DialCompleted(PeerId),
    AddedToDialQueue(PeerId),
}

/// Finite, non-restartable sequence of blocks served by a single peer.
///
/// The producer side feeds a bounded channel; closing the stream is observed
/// by the producer through the channel, so an abandoned stream stops pulling
/// data from the peer.
#[derive(Debug)]
pub struct BlockStream {
    rx: mpsc::Receiver<Block>,
}

impl BlockStream {
    pub fn new(rx: mpsc::Receiver<Block>) -> Self {
        Self { rx }
    }

    /// Receive the next block; `None` once the peer is done.
    pub async fn recv(&mut self) -> Option<Block> {
        self.rx.recv().await
    }

    /// Stop the stream.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Transport used to pull chain data from remote peers.
///
/// Implementations own the wire protocol; the sync core only consumes
/// statuses, lifecycle events, block streams, and the batch RPCs.
#[async_trait]
pub trait SyncPeerClient: Send + Sync + 'static {
    /// Start the transport.
    async fn start(&self) -> Result<()>;

    /// Tear the transport down.
    fn close(&self);

    /// Current status of a single peer.
    async fn peer_status(&self, peer_id: PeerId) -> Result<NoForkPeer>;

    /// Statuses of all currently connected peers.
    async fn connected_peer_statuses(&self) -> Vec<NoForkPeer>;

    /// Open a block stream from `peer_id` starting at height `start`.
    async fn open_block_stream(&self, peer_id: PeerId, start: u64) -> Result<BlockStream>;

    /// Close the block stream held open for `peer_id`, if any.
    async fn close_stream(&self, peer_id: PeerId) -> Result<()>;

    /// Subscribe to peer status updates.
    fn subscribe_status_updates(&self) -> mpsc::UnboundedReceiver<NoForkPeer>;

    /// Subscribe to peer connection lifecycle events.
    fn subscribe_peer_events(&self) -> mpsc::UnboundedReceiver<PeerEvent>;

    /// Request up to `count` headers ascending from `start`.
    async fn request_headers(&self, peer_id: PeerId, start: u64, count: u64) -> Result<Vec<Header>>;

    /// Request block bodies by header hash, in order.
    async fn request_bodies(&self, peer_id: PeerId, hashes: &[B256]) -> Result<Vec<BlockBody>>;

    /// Request per-block receipt lists by header hash, in order.
    async fn request_receipts(&self, peer_id: PeerId, hashes: &[B256])
        -> Result<Vec<Vec<Receipt>>>;
}

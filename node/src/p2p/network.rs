//! reth-network-backed transport.

use super::{BlockStream, NoForkPeer, PeerEvent, SyncPeerClient, BLOCK_STREAM_BUFFER};
use crate::sync::has_body;
use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use parking_lot::Mutex;
use reth_chainspec::MAINNET;
use reth_eth_wire::{EthNetworkPrimitives, EthVersion};
use reth_eth_wire_types::{
    BlockHashOrNumber, GetBlockBodies, GetBlockHeaders, GetReceipts, GetReceipts70,
    HeadersDirection,
};
use reth_ethereum_primitives::{Block, BlockBody, Receipt};
use reth_network::config::{rng_secret_key, NetworkConfigBuilder};
use reth_network::import::ProofOfStakeBlockImport;
use reth_network::{NetworkHandle, PeersConfig, PeersInfo};
use reth_network_api::{
    events::PeerEvent as SessionEvent, NetworkEvent, NetworkEventListenerProvider, PeerId,
    PeerRequest, PeerRequestSender,
};
use reth_primitives_traits::{Header, SealedHeader};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(4);
const MAX_HEADERS_PER_REQUEST: u64 = 1024;
const STREAM_CHUNK: u64 = 128;
const PEER_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Active session with a connected peer.
#[derive(Clone, Debug)]
struct PeerSession {
    peer_id: PeerId,
    eth_version: EthVersion,
    head_hash: B256,
    messages: PeerRequestSender<PeerRequest<EthNetworkPrimitives>>,
}

#[derive(Default)]
struct NetworkState {
    sessions: Mutex<HashMap<PeerId, PeerSession>>,
    statuses: Mutex<HashMap<PeerId, NoForkPeer>>,
    status_subscribers: Mutex<Vec<mpsc::UnboundedSender<NoForkPeer>>>,
    event_subscribers: Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
    streams: Mutex<HashMap<PeerId, JoinHandle<()>>>,
}

impl NetworkState {
    fn publish_status(&self, status: NoForkPeer) {
        self.statuses.lock().insert(status.id, status.clone());
        self.status_subscribers
            .lock()
            .retain(|tx| tx.send(status.clone()).is_ok());
    }

    fn publish_event(&self, event: PeerEvent) {
        self.event_subscribers
            .lock()
            .retain(|tx| tx.send(event).is_ok());
    }

    fn forget_peer(&self, peer_id: PeerId) {
        self.sessions.lock().remove(&peer_id);
        self.statuses.lock().remove(&peer_id);
        self.publish_event(PeerEvent::Disconnected(peer_id));
    }

    fn session(&self, peer_id: PeerId) -> Option<PeerSession> {
        self.sessions.lock().get(&peer_id).cloned()
    }
}

/// Sync transport backed by the devp2p stack.
pub struct NetworkClient {
    handle: NetworkHandle<EthNetworkPrimitives>,
    local_peer_id: PeerId,
    min_peers: usize,
    state: Arc<NetworkState>,
}

/// Start the devp2p network and begin tracking compatible peers.
pub async fn connect_mainnet(min_peers: usize) -> Result<NetworkClient> {
    let secret_key = rng_secret_key();
    let net_config = NetworkConfigBuilder::<EthNetworkPrimitives>::new(secret_key)
        .mainnet_boot_nodes()
        .with_unused_ports()
        .peer_config(PeersConfig::default())
        .disable_tx_gossip(true)
        .block_import(Box::new(ProofOfStakeBlockImport::default()))
        .build_with_noop_provider(MAINNET.clone());

    let handle = net_config
        .start_network()
        .await
        .wrap_err("failed to start p2p network")?;
    let local_peer_id = *handle.peer_id();
    let state = Arc::new(NetworkState::default());
    spawn_session_watcher(handle.clone(), Arc::clone(&state), local_peer_id);
    Ok(NetworkClient {
        handle,
        local_peer_id,
        min_peers: min_peers.max(1),
        state,
    })
}

fn spawn_session_watcher(
    handle: NetworkHandle<EthNetworkPrimitives>,
    state: Arc<NetworkState>,
    local_peer_id: PeerId,
) {
    tokio::spawn(async move {
        let mut events = handle.event_listener();
        while let Some(event) = events.next().await {
            match event {
                NetworkEvent::ActivePeerSession { info, messages } => {
                    if info.status.genesis != MAINNET.genesis_hash() {
                        debug!(peer_id = ?info.peer_id, "ignoring peer: genesis mismatch");
                        continue;
                    }
                    let peer_id = info.peer_id;
                    let session = PeerSession {
                        peer_id,
                        eth_version: info.version,
                        head_hash: info.status.blockhash,
                        messages,
                    };
                    state.sessions.lock().insert(peer_id, session.clone());
                    state.publish_event(PeerEvent::Connected(peer_id));
                    debug!(peer_id = ?peer_id, eth_version = %info.version, "peer session established");

                    // probe the advertised head so the peer becomes eligible
                    // for selection
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        match probe_peer_status(&session, local_peer_id).await {
                            Ok(status) => state.publish_status(status),
                            Err(err) => {
                                debug!(peer_id = ?peer_id, error = %err, "failed to probe peer head");
                            }
                        }
                    });
                }
                NetworkEvent::Peer(SessionEvent::SessionClosed { peer_id, reason }) => {
                    debug!(peer_id = ?peer_id, reason = ?reason, "peer session closed");
                    state.forget_peer(peer_id);
                }
                NetworkEvent::Peer(SessionEvent::PeerRemoved(peer_id)) => {
                    state.forget_peer(peer_id);
                }
                NetworkEvent::Peer(_) => {}
            }
        }
    });
}

/// Resolve a peer's advertised head into a status entry.
async fn probe_peer_status(session: &PeerSession, local_peer_id: PeerId) -> Result<NoForkPeer> {
    let headers = request_headers_inner(
        session,
        BlockHashOrNumber::Hash(session.head_hash),
        1,
    )
    .await?;
    let header = headers
        .first()
        .ok_or_else(|| eyre!("empty header response for head"))?;
    Ok(NoForkPeer {
        id: session.peer_id,
        number: header.number,
        distance: xor_distance(local_peer_id, session.peer_id),
    })
}

/// Opaque ordering key for equally tall peers.
fn xor_distance(a: PeerId, b: PeerId) -> U256 {
    let mut out = [0u8; 32];
    for (idx, byte) in out.iter_mut().enumerate() {
        *byte = a.as_slice()[idx] ^ b.as_slice()[idx];
    }
    U256::from_be_bytes(out)
}

async fn request_headers_inner(
    session: &PeerSession,
    start: BlockHashOrNumber,
    limit: u64,
) -> Result<Vec<Header>> {
    let request = GetBlockHeaders {
        start_block: start,
        limit,
        skip: 0,
        direction: HeadersDirection::Rising,
    };
    let (tx, rx) = oneshot::channel();
    session
        .messages
        .try_send(PeerRequest::GetBlockHeaders {
            request,
            response: tx,
        })
        .map_err(|err| eyre!("failed to send header request: {err:?}"))?;
    let response = timeout(REQUEST_TIMEOUT, rx)
        .await
        .map_err(|_| eyre!("header request to {:?} timed out", session.peer_id))??;
    let headers = response
        .map_err(|err| eyre!("header response error from {:?}: {err:?}", session.peer_id))?;
    Ok(headers.0)
}

/// Walk headers forward in wire-sized chunks until `count` are collected or
/// the peer comes up short.
async fn request_headers_chunked(
    session: &PeerSession,
    start: u64,
    count: u64,
) -> Result<Vec<Header>> {
    let mut headers = Vec::with_capacity(count as usize);
    let mut current = start;
    let mut remaining = count;
    while remaining > 0 {
        let batch = remaining.min(MAX_HEADERS_PER_REQUEST);
        let mut batch_headers =
            request_headers_inner(session, BlockHashOrNumber::Number(current), batch).await?;
        if batch_headers.is_empty() {
            break;
        }
        let received = batch_headers.len() as u64;
        headers.append(&mut batch_headers);
        if received < batch {
            break;
        }
        current = current.saturating_add(received);
        remaining = remaining.saturating_sub(received);
    }
    Ok(headers)
}

async fn request_bodies_inner(session: &PeerSession, hashes: &[B256]) -> Result<Vec<BlockBody>> {
    let request = GetBlockBodies::from(hashes.to_vec());
    let (tx, rx) = oneshot::channel();
    session
        .messages
        .try_send(PeerRequest::GetBlockBodies {
            request,
            response: tx,
        })
        .map_err(|err| eyre!("failed to send body request: {err:?}"))?;
    let response = timeout(REQUEST_TIMEOUT, rx)
        .await
        .map_err(|_| eyre!("body request to {:?} timed out", session.peer_id))??;
    let bodies = response
        .map_err(|err| eyre!("body response error from {:?}: {err:?}", session.peer_id))?;
    Ok(bodies.0)
}

async fn request_receipts_inner(
    session: &PeerSession,
    hashes: &[B256],
) -> Result<Vec<Vec<Receipt>>> {
    match session.eth_version {
        EthVersion::Eth70 => request_receipts70(session, hashes).await,
        EthVersion::Eth69 => request_receipts69(session, hashes).await,
        _ => request_receipts_legacy(session, hashes).await,
    }
}

async fn request_receipts_legacy(
    session: &PeerSession,
    hashes: &[B256],
) -> Result<Vec<Vec<Receipt>>> {
    let request = GetReceipts(hashes.to_vec());
    let (tx, rx) = oneshot::channel();
    session
        .messages
        .try_send(PeerRequest::GetReceipts {
            request,
            response: tx,
        })
        .map_err(|err| eyre!("failed to send receipts request: {err:?}"))?;
    let response = timeout(REQUEST_TIMEOUT, rx)
        .await
        .map_err(|_| eyre!("receipts request to {:?} timed out", session.peer_id))??;
    let receipts = response
        .map_err(|err| eyre!("receipts response error from {:?}: {err:?}", session.peer_id))?;
    Ok(receipts
        .0
        .into_iter()
        .map(|block| block.into_iter().map(|receipt| receipt.receipt).collect())
        .collect())
}

async fn request_receipts69(session: &PeerSession, hashes: &[B256]) -> Result<Vec<Vec<Receipt>>> {
    let request = GetReceipts(hashes.to_vec());
    let (tx, rx) = oneshot::channel();
    session
        .messages
        .try_send(PeerRequest::GetReceipts69 {
            request,
            response: tx,
        })
        .map_err(|err| eyre!("failed to send receipts69 request: {err:?}"))?;
    let response = timeout(REQUEST_TIMEOUT, rx)
        .await
        .map_err(|_| eyre!("receipts69 request to {:?} timed out", session.peer_id))??;
    let receipts = response
        .map_err(|err| eyre!("receipts69 response error from {:?}: {err:?}", session.peer_id))?;
    Ok(receipts.0)
}

async fn request_receipts70(session: &PeerSession, hashes: &[B256]) -> Result<Vec<Vec<Receipt>>> {
    let request = GetReceipts70 {
        first_block_receipt_index: 0,
        block_hashes: hashes.to_vec(),
    };
    let (tx, rx) = oneshot::channel();
    session
        .messages
        .try_send(PeerRequest::GetReceipts70 {
            request,
            response: tx,
        })
        .map_err(|err| eyre!("failed to send receipts70 request: {err:?}"))?;
    let response = timeout(REQUEST_TIMEOUT, rx)
        .await
        .map_err(|_| eyre!("receipts70 request to {:?} timed out", session.peer_id))??;
    let receipts = response
        .map_err(|err| eyre!("receipts70 response error from {:?}: {err:?}", session.peer_id))?;
    // eth/70 may flag the last block as incomplete; consumers requeue any
    // blocks that come back short
    Ok(receipts.receipts)
}

/// Produce blocks forward from `start` into the stream channel until the peer
/// runs out, an error occurs, or the consumer closes the stream.
async fn run_block_stream(session: PeerSession, start: u64, tx: mpsc::Sender<Block>) {
    let mut cursor = start;
    'chunks: loop {
        let headers = match request_headers_inner(
            &session,
            BlockHashOrNumber::Number(cursor),
            STREAM_CHUNK,
        )
        .await
        {
            Ok(headers) => headers,
            Err(err) => {
                debug!(peer_id = ?session.peer_id, error = %err, "block stream: header request failed");
                break;
            }
        };
        if headers.is_empty() {
            break;
        }
        let received = headers.len() as u64;
        let sealed: Vec<SealedHeader> = headers.into_iter().map(SealedHeader::seal_slow).collect();

        let hashes: Vec<B256> = sealed
            .iter()
            .filter(|header| has_body(header.header()))
            .map(SealedHeader::hash)
            .collect();
        let bodies = if hashes.is_empty() {
            Vec::new()
        } else {
            match request_bodies_inner(&session, &hashes).await {
                Ok(bodies) => bodies,
                Err(err) => {
                    debug!(peer_id = ?session.peer_id, error = %err, "block stream: body request failed");
                    break;
                }
            }
        };

        let mut bodies = bodies.into_iter();
        for header in sealed {
            let body = if has_body(header.header()) {
                match bodies.next() {
                    Some(body) => body,
                    // partial body response; end the stream at the gap
                    None => break 'chunks,
                }
            } else {
                BlockBody::default()
            };
            let block = Block {
                header: header.header().clone(),
                body,
            };
            if tx.send(block).await.is_err() {
                // consumer closed the stream
                return;
            }
        }

        cursor = cursor.saturating_add(received);
        if received < STREAM_CHUNK {
            break;
        }
    }
}

#[async_trait]
impl SyncPeerClient for NetworkClient {
    async fn start(&self) -> Result<()> {
        loop {
            let connected = self.state.sessions.lock().len();
            if connected >= self.min_peers {
                info!(
                    connected,
                    reth_connected = self.handle.num_connected_peers(),
                    "peer startup complete"
                );
                return Ok(());
            }
            sleep(PEER_POLL_INTERVAL).await;
        }
    }

    fn close(&self) {
        for (_, stream) in self.state.streams.lock().drain() {
            stream.abort();
        }
        self.state.status_subscribers.lock().clear();
        self.state.event_subscribers.lock().clear();
    }

    async fn peer_status(&self, peer_id: PeerId) -> Result<NoForkPeer> {
        if let Some(status) = self.state.statuses.lock().get(&peer_id).cloned() {
            return Ok(status);
        }
        let session = self
            .state
            .session(peer_id)
            .ok_or_else(|| eyre!("peer {peer_id:?} is not connected"))?;
        let status = probe_peer_status(&session, self.local_peer_id).await?;
        self.state.statuses.lock().insert(peer_id, status.clone());
        Ok(status)
    }

    async fn connected_peer_statuses(&self) -> Vec<NoForkPeer> {
        self.state.statuses.lock().values().cloned().collect()
    }

    async fn open_block_stream(&self, peer_id: PeerId, start: u64) -> Result<BlockStream> {
        let session = self
            .state
            .session(peer_id)
            .ok_or_else(|| eyre!("peer {peer_id:?} is not connected"))?;
        let (tx, rx) = mpsc::channel(BLOCK_STREAM_BUFFER);
        let producer = tokio::spawn(run_block_stream(session, start, tx));
        if let Some(previous) = self.state.streams.lock().insert(peer_id, producer) {
            previous.abort();
        }
        Ok(BlockStream::new(rx))
    }

    async fn close_stream(&self, peer_id: PeerId) -> Result<()> {
        if let Some(producer) = self.state.streams.lock().remove(&peer_id) {
            producer.abort();
        }
        Ok(())
    }

    fn subscribe_status_updates(&self) -> mpsc::UnboundedReceiver<NoForkPeer> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.status_subscribers.lock().push(tx);
        rx
    }

    fn subscribe_peer_events(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.event_subscribers.lock().push(tx);
        rx
    }

    async fn request_headers(&self, peer_id: PeerId, start: u64, count: u64) -> Result<Vec<Header>> {
        let session = self
            .state
            .session(peer_id)
            .ok_or_else(|| eyre!("peer {peer_id:?} is not connected"))?;
        request_headers_chunked(&session, start, count).await
    }

    async fn request_bodies(&self, peer_id: PeerId, hashes: &[B256]) -> Result<Vec<BlockBody>> {
        let session = self
            .state
            .session(peer_id)
            .ok_or_else(|| eyre!("peer {peer_id:?} is not connected"))?;
        request_bodies_inner(&session, hashes).await
    }

    async fn request_receipts(
        &self,
        peer_id: PeerId,
        hashes: &[B256],
    ) -> Result<Vec<Vec<Receipt>>> {
        let session = self
            .state
            .session(peer_id)
            .ok_or_else(|| eyre!("peer {peer_id:?} is not connected"))?;
        request_receipts_inner(&session, hashes).await
    }
}

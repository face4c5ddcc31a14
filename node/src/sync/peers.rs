//! Peer registry.

use crate::p2p::NoForkPeer;
use parking_lot::RwLock;
use reth_network_api::PeerId;
use std::collections::{HashMap, HashSet};
use tokio::sync::Notify;

/// Registry of peers assumed to share our chain, keyed by peer id.
///
/// Every upsert signals `new_status` so a watching driver can re-evaluate
/// peer selection; the signal is dropped when nobody is listening. Reads are
/// snapshots and need not be coherent: selection is retried on every driver
/// iteration.
#[derive(Debug, Default)]
pub struct PeerMap {
    peers: RwLock<HashMap<PeerId, NoForkPeer>>,
    new_status: Notify,
}

impl PeerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer status.
    pub fn put(&self, peer: NoForkPeer) {
        self.peers.write().insert(peer.id, peer);
        self.new_status.notify_one();
    }

    pub fn put_peers(&self, peers: Vec<NoForkPeer>) {
        for peer in peers {
            self.put(peer);
        }
    }

    pub fn remove(&self, peer_id: &PeerId) {
        self.peers.write().remove(peer_id);
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Visit a snapshot of the registry in unspecified order; return `false`
    /// to stop early.
    pub fn range(&self, mut f: impl FnMut(&NoForkPeer) -> bool) {
        let snapshot: Vec<NoForkPeer> = self.peers.read().values().cloned().collect();
        for peer in &snapshot {
            if !f(peer) {
                break;
            }
        }
    }

    /// Best peer strictly ahead of `latest`, ordered by advertised number
    /// with distance as the tie break.
    pub fn best_peer(&self, latest: u64) -> Option<NoForkPeer> {
        self.best_peer_excluding(latest, &HashSet::new())
    }

    pub(crate) fn best_peer_excluding(
        &self,
        latest: u64,
        skip: &HashSet<PeerId>,
    ) -> Option<NoForkPeer> {
        let peers = self.peers.read();
        let mut best: Option<&NoForkPeer> = None;
        for peer in peers.values() {
            if peer.number <= latest || skip.contains(&peer.id) {
                continue;
            }
            if best.is_none_or(|current| peer.is_better(current)) {
                best = Some(peer);
            }
        }
        best.cloned()
    }

    /// Whether any registered peer is ahead of `latest`.
    pub fn has_sync_peer(&self, latest: u64) -> bool {
        self.best_peer(latest).is_some()
    }

    /// Signal fired on every status upsert.
    pub fn new_status(&self) -> &Notify {
        &self.new_status
    }
}

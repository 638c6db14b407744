//! Thread-safe double-index of `ChannelPeer`s plus the dst channel pool.
//!
//! Grounded on the `LegacyCache` pattern documented in
//! `harborgrid-justin-rusty-db/src/common/concurrent_map.rs`: a single
//! `parking_lot::RwLock<HashMap<..>>` rather than a `DashMap` for the peer
//! index, because every mutating operation here must touch *two* keys
//! (agent id and dst id) as one atomic unit (spec.md §4.1/§5) — a guarantee
//! a sharded map can't give without extra coordination of its own. The dst
//! pool is single-keyed and uses a `DashMap` for lock-free reads, matching
//! the "Modern Cache" half of the same teacher file.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::{ChannelPeer, DynChannel};
use crate::error::{ProxyError, Result};

#[derive(Default)]
pub struct ChannelRegistry {
    peers: RwLock<HashMap<String, Arc<ChannelPeer>>>,
    dst_channels: DashMap<String, DynChannel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer under both its agent id and dst id.
    ///
    /// Fails with `AlreadyPaired` if either id already maps to a *different*
    /// peer, and never partially inserts (I1/I2/I4).
    pub fn put_peer(&self, peer: Arc<ChannelPeer>) -> Result<()> {
        let agent_id = peer.agent_channel.id().to_string();
        let dst_id = peer.dst_channel.id().to_string();

        let mut peers = self.peers.write();
        if let Some(existing) = peers.get(&agent_id) {
            if !Arc::ptr_eq(existing, &peer) {
                return Err(ProxyError::AlreadyPaired(agent_id));
            }
        }
        if let Some(existing) = peers.get(&dst_id) {
            if !Arc::ptr_eq(existing, &peer) {
                return Err(ProxyError::AlreadyPaired(dst_id));
            }
        }
        peers.insert(agent_id, Arc::clone(&peer));
        peers.insert(dst_id, peer);
        Ok(())
    }

    pub fn get_peer_by_agent(&self, agent_id: &str) -> Option<Arc<ChannelPeer>> {
        self.peers.read().get(agent_id).cloned()
    }

    pub fn get_peer_by_dst(&self, dst_id: &str) -> Option<Arc<ChannelPeer>> {
        self.peers.read().get(dst_id).cloned()
    }

    /// Remove both index entries for the peer reachable from `agent_id`.
    /// Idempotent: returns `None` if already removed.
    pub fn remove_peer_by_agent(&self, agent_id: &str) -> Option<Arc<ChannelPeer>> {
        let mut peers = self.peers.write();
        let peer = peers.remove(agent_id)?;
        peers.remove(peer.dst_channel.id());
        Some(peer)
    }

    /// Remove both index entries for the peer reachable from `dst_id`.
    /// Idempotent: returns `None` if already removed.
    pub fn remove_peer_by_dst(&self, dst_id: &str) -> Option<Arc<ChannelPeer>> {
        let mut peers = self.peers.write();
        let peer = peers.remove(dst_id)?;
        peers.remove(peer.agent_channel.id());
        Some(peer)
    }

    pub fn put_dst(&self, dst: DynChannel) {
        self.dst_channels.insert(dst.id().to_string(), dst);
    }

    pub fn remove_dst(&self, dst_id: &str) -> Option<DynChannel> {
        self.dst_channels.remove(dst_id).map(|(_, v)| v)
    }

    pub fn dst_values(&self) -> Vec<DynChannel> {
        self.dst_channels.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn dst_len(&self) -> usize {
        self.dst_channels.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Remove and return every distinct peer, deduplicated (each peer is
    /// indexed under two keys). Used by `ReleaseChannelPeers` to stop every
    /// pair exactly once during shutdown.
    pub fn drain_peers(&self) -> Vec<Arc<ChannelPeer>> {
        let mut peers = self.peers.write();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for (_, peer) in peers.drain() {
            if seen.insert(Arc::as_ptr(&peer) as usize) {
                out.push(peer);
            }
        }
        out
    }

    pub fn clear_dst(&self) {
        self.dst_channels.clear();
    }
}

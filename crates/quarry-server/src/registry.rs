//! Peer registry — live connections keyed by remote address.
//!
//! Installed as the transport's `PeerHook`: a connection is registered
//! once its handshake passes and evicted when its task exits.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use quarry_net::{Peer, PeerHook, TransportError};

#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<SocketAddr, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Peer> {
        self.peers.get(addr).map(|entry| entry.value().clone())
    }

    /// Current peers. Clones, so no map lock is held while writing to them.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerHook for PeerRegistry {
    fn on_connect(&self, peer: &Peer) -> Result<(), TransportError> {
        let addr = peer.remote_addr();
        if self.peers.insert(addr, peer.clone()).is_some() {
            tracing::debug!(peer = %addr, "replaced existing connection");
        }
        tracing::info!(peer = %addr, outbound = peer.is_outbound(), "connected with remote");
        Ok(())
    }

    fn on_disconnect(&self, peer: &Peer) {
        let addr = peer.remote_addr();
        // A newer connection from the same address may already have taken the slot.
        if self
            .peers
            .remove_if(&addr, |_, current| current.same_connection(peer))
            .is_some()
        {
            tracing::info!(peer = %addr, "peer removed");
        }
    }
}

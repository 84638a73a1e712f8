use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::peer::{Peer, BROADCAST_PEER_ID, SERVER_PEER_ID};

/// where a data frame addressed to `dest_id` has to go
pub enum RelayDecision {
    /// deliver to the local application only
    DeliverLocally,
    /// deliver locally and re-emit to every peer except the sender
    Broadcast,
    /// re-emit to this peer only
    Forward(Arc<Peer>),
    /// no such peer - tell the sender so it can prune its peer list
    UnknownDestination(u8),
}

/// The registry of connected peers. Peer ids are unique and stable for a
///  session; id 1 is the local server itself and never appears here, id 0
///  addresses all peers.
///
/// Handshake acceptance (the only place ids are allocated) runs on the
///  listener task, so allocation needs no coordination; removal can come
///  from the eviction loop concurrently, which the concurrent map absorbs.
pub struct SessionManager {
    peers: DashMap<u8, Arc<Peer>>,
    by_addr: DashMap<SocketAddr, u8>,
    /// total endpoint cap, the server's own identity included
    max_clients: u8,
}

impl SessionManager {
    pub fn new(max_clients: u8) -> SessionManager {
        SessionManager {
            peers: DashMap::new(),
            by_addr: DashMap::new(),
            max_clients,
        }
    }

    pub fn get(&self, peer_id: u8) -> Option<Arc<Peer>> {
        self.peers.get(&peer_id).map(|e| e.value().clone())
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        let peer_id = *self.by_addr.get(addr)?;
        self.get(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// true iff accepting one more peer would exceed the cap (the server
    ///  itself occupies one of the `max_clients` slots)
    pub fn is_full(&self) -> bool {
        self.len() + 1 >= self.max_clients as usize
    }

    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn all_except(&self, peer_id: u8) -> Vec<Arc<Peer>> {
        self.peers.iter()
            .filter(|e| *e.key() != peer_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Allocate the lowest unused peer id >= 2 and register the peer under
    ///  it. `None` when the cap is reached or the id space is exhausted.
    pub fn add(&self, addr: SocketAddr, username: String, color: u32) -> Option<Arc<Peer>> {
        if self.is_full() {
            return None;
        }

        let peer_id = ((SERVER_PEER_ID + 1)..=self.max_clients)
            .find(|id| !self.peers.contains_key(id))?;

        let peer = Arc::new(Peer::new(peer_id, addr, username, color));
        self.peers.insert(peer_id, peer.clone());
        self.by_addr.insert(addr, peer_id);

        info!("peer {} connected from {:?} as {:?}", peer_id, addr, peer.username);
        Some(peer)
    }

    /// Register a peer under a fixed id - used by the client role for its
    ///  one peer, the server.
    pub fn add_with_id(&self, peer_id: u8, addr: SocketAddr, username: String, color: u32) -> Arc<Peer> {
        let peer = Arc::new(Peer::new(peer_id, addr, username, color));
        self.peers.insert(peer_id, peer.clone());
        self.by_addr.insert(addr, peer_id);
        peer
    }

    /// Atomic removal: a concurrent send or retransmit task that looks the
    ///  peer up afterwards sees it gone and backs off.
    pub fn remove(&self, peer_id: u8) -> Option<Arc<Peer>> {
        let (_, peer) = self.peers.remove(&peer_id)?;
        self.by_addr.remove(&peer.addr);
        debug!("peer {} removed", peer_id);
        Some(peer)
    }

    pub fn clear(&self) {
        self.peers.clear();
        self.by_addr.clear();
    }

    pub fn route(&self, dest_id: u8) -> RelayDecision {
        match dest_id {
            SERVER_PEER_ID => RelayDecision::DeliverLocally,
            BROADCAST_PEER_ID => RelayDecision::Broadcast,
            dest_id => match self.get(dest_id) {
                Some(peer) => RelayDecision::Forward(peer),
                None => RelayDecision::UnknownDestination(dest_id),
            },
        }
    }
}

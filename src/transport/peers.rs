//! Live-peer table for servers.
//!
//! Holds one [`Link`] per connected peer and enforces the server's capacity. The
//! capacity check and the insert happen under the same write lock, so two
//! simultaneous accepts can never both take the last slot.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::core::packet::Packet;
use crate::core::peer::PeerId;
use crate::transport::{same_link, Link};

/// Outcome of [`PeerTable::try_insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Full,
    /// A session for this peer already exists
    Duplicate,
}

pub struct PeerTable {
    links: RwLock<HashMap<PeerId, Arc<dyn Link>>>,
    capacity: usize,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a new session if there is room
    pub fn try_insert(&self, link: Arc<dyn Link>) -> Admission {
        let peer = link.peer_id();
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        if links.contains_key(&peer) {
            return Admission::Duplicate;
        }
        if links.len() >= self.capacity {
            debug!(%peer, capacity = self.capacity, "Peer table full");
            return Admission::Full;
        }
        links.insert(peer, link);
        Admission::Admitted
    }

    pub fn remove(&self, peer: &PeerId) -> Option<Arc<dyn Link>> {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer)
    }

    /// Remove `peer` only while it is still served by `link`
    pub fn remove_link(&self, link: &Arc<dyn Link>) -> bool {
        let peer = link.peer_id();
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        match links.get(&peer) {
            Some(current) if same_link(current, link) => {
                links.remove(&peer);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<Arc<dyn Link>> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(peer)
    }

    /// Copy of the current sessions, taken under a short read lock
    pub fn snapshot(&self) -> Vec<Arc<dyn Link>> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Remove and return every session
    pub fn drain(&self) -> Vec<Arc<dyn Link>> {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, link)| link)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `packet` to every peer. Returns `false` if any send failed.
    pub async fn broadcast(&self, packet: &Packet) -> bool {
        self.broadcast_except(None, packet).await
    }

    /// Send `packet` to every peer but `except`. Returns `false` if any send failed.
    pub async fn broadcast_except(&self, except: Option<&PeerId>, packet: &Packet) -> bool {
        let mut all_sent = true;
        for link in self.snapshot() {
            let peer = link.peer_id();
            if except == Some(&peer) {
                continue;
            }
            if let Err(e) = link.send_packet(packet.clone()).await {
                warn!(%peer, tag = %packet.tag, error = %e, "Broadcast send failed");
                all_sent = false;
            }
        }
        all_sent
    }
}

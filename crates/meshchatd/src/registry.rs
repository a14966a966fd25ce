//! Neighbour set and known-peer registry

use meshchat_core::{Peer, PeerId, TrustSet};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use tracing::debug;

/// Fixed gossip fan-out
pub const MAX_NEIGHBOURS: usize = 4;

/// Outcome of a neighbour insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighbourInsert {
    /// Appended without eviction
    Inserted,
    /// Appended after evicting the oldest entry
    Rotated(Peer),
    /// Already present, nothing changed
    Duplicate,
}

/// Bounded, ordered neighbour list with FIFO eviction
#[derive(Debug, Clone)]
pub struct NeighbourSet {
    entries: VecDeque<Peer>,
    capacity: usize,
}

impl NeighbourSet {
    /// Create an empty set holding at most [`MAX_NEIGHBOURS`]
    pub fn new() -> Self {
        Self::with_capacity(MAX_NEIGHBOURS)
    }

    /// Create an empty set with a custom bound
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Insert under the bounded-rotation rule
    pub fn insert(&mut self, peer: Peer) -> NeighbourInsert {
        if self.entries.contains(&peer) {
            return NeighbourInsert::Duplicate;
        }

        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(peer);
        debug!("{} new neighbour", peer.addr);

        match evicted {
            Some(old) => {
                debug!("rotating, removed neighbour {}", old.addr);
                NeighbourInsert::Rotated(old)
            }
            None => NeighbourInsert::Inserted,
        }
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        self.entries.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.entries.iter()
    }

    /// Snapshot in insertion order
    pub fn to_vec(&self) -> Vec<Peer> {
        self.entries.iter().copied().collect()
    }

    /// Snapshot without any entry for `id`
    pub fn excluding(&self, id: &PeerId) -> Vec<Peer> {
        self.entries.iter().filter(|p| p.id != *id).copied().collect()
    }
}

impl Default for NeighbourSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Every peer ever learned, keyed by public key, last address wins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownPeers {
    peers: HashMap<PeerId, IpAddr>,
}

impl KnownPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address, returning the previous one if the key was known
    pub fn insert(&mut self, id: PeerId, addr: IpAddr) -> Option<IpAddr> {
        self.peers.insert(id, addr)
    }

    pub fn get(&self, id: &PeerId) -> Option<IpAddr> {
        self.peers.get(id).copied()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Union with remote entries; remote addresses win on collision.
    ///
    /// Returns how many keys were not known before.
    pub fn merge(&mut self, entries: impl IntoIterator<Item = Peer>) -> usize {
        let mut added = 0;
        for peer in entries {
            if self.peers.insert(peer.id, peer.addr).is_none() {
                added += 1;
            }
        }
        added
    }

    /// All entries except the one for `id`
    pub fn without(&self, id: &PeerId) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|(k, _)| *k != id)
            .map(|(k, addr)| Peer::new(*addr, *k))
            .collect()
    }

    /// All entries
    pub fn peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .map(|(k, addr)| Peer::new(*addr, *k))
            .collect()
    }

    /// Every known key, as handshake trust
    pub fn ids(&self) -> TrustSet {
        self.peers.keys().copied().collect()
    }
}

/// Overlay registries, mutated together under one lock
#[derive(Debug, Default)]
pub struct Registry {
    pub neighbours: NeighbourSet,
    pub known: KnownPeers,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly connected peer in both registries.
    ///
    /// Returns true when the key was not known before.
    pub fn record_connected(&mut self, peer: Peer) -> bool {
        let is_new = self.known.insert(peer.id, peer.addr).is_none();
        self.neighbours.insert(peer);
        is_new
    }
}

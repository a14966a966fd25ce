//! Canonical encoding for gossip payloads
//!
//! Payload frames that follow a control code use postcard serialization:
//! - neighbour reply: `Vec<Peer>`
//! - known-peer reply: `Vec<Peer>` (the registry flattened to entries)
//! - new-peer alert: a single `Peer`
//!
//! Entries are sorted by key so the same registry always encodes to the same
//! bytes.

use crate::error::{Error, Result};
use crate::types::*;
use serde::{de::DeserializeOwned, Serialize};

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Deserialize a value from canonical bytes.
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// Encode a neighbour list, preserving its order.
pub fn encode_neighbours(neighbours: &[Peer]) -> Result<Vec<u8>> {
    canonical_bytes(&neighbours)
}

/// Decode a neighbour list.
pub fn decode_neighbours(bytes: &[u8]) -> Result<Vec<Peer>> {
    from_canonical_bytes(bytes)
}

/// Encode known-peer entries sorted by key.
pub fn encode_known_peers(entries: impl IntoIterator<Item = Peer>) -> Result<Vec<u8>> {
    let mut entries: Vec<Peer> = entries.into_iter().collect();
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    canonical_bytes(&entries)
}

/// Decode known-peer entries.
pub fn decode_known_peers(bytes: &[u8]) -> Result<Vec<Peer>> {
    from_canonical_bytes(bytes)
}

/// Encode a new-peer alert.
pub fn encode_new_peer(peer: &Peer) -> Result<Vec<u8>> {
    canonical_bytes(peer)
}

/// Decode a new-peer alert.
pub fn decode_new_peer(bytes: &[u8]) -> Result<Peer> {
    from_canonical_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn peer(n: u8) -> Peer {
        Peer::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), PeerId([n; 32]))
    }

    #[test]
    fn test_neighbours_keep_order() {
        let list = vec![peer(3), peer(1), peer(2)];
        let bytes = encode_neighbours(&list).unwrap();
        assert_eq!(decode_neighbours(&bytes).unwrap(), list);
    }

    #[test]
    fn test_known_peers_deterministic() {
        let a = encode_known_peers(vec![peer(2), peer(1)]).unwrap();
        let b = encode_known_peers(vec![peer(1), peer(2)]).unwrap();
        assert_eq!(a, b);
        assert_eq!(decode_known_peers(&a).unwrap(), vec![peer(1), peer(2)]);
    }

    #[test]
    fn test_new_peer_ipv6() {
        let p = Peer::new(IpAddr::V6(Ipv6Addr::LOCALHOST), PeerId([9; 32]));
        let bytes = encode_new_peer(&p).unwrap();
        assert_eq!(decode_new_peer(&bytes).unwrap(), p);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode_new_peer(&[0xff]).is_err());
        assert!(decode_neighbours(&[0x05, 0x00]).is_err());
    }

    #[test]
    fn test_empty_list() {
        let bytes = encode_neighbours(&[]).unwrap();
        assert!(decode_neighbours(&bytes).unwrap().is_empty());
    }
}

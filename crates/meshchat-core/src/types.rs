//! Core types shared by the channel and overlay layers
//!
//! A peer's durable identity is its Ed25519 verifying key; its location is
//! the IP address it was last observed at. Every node listens on the same
//! port, so the address alone is enough to reach it.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// 32-byte fixed-size array used for public keys.
pub type Bytes32 = [u8; 32];

/// Length of a public key on the wire
pub const PUBLIC_KEY_LEN: usize = 32;

// =============================================================================
// IDENTITY TYPES
// =============================================================================

/// Durable peer identifier: the peer's long-term public key bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub Bytes32);

impl PeerId {
    /// Create from public key bytes
    pub fn from_public_key(public_key: &Bytes32) -> Self {
        Self(*public_key)
    }

    /// Parse raw key bytes received from the wire
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: Bytes32 = bytes.try_into().map_err(|_| {
            Error::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }

    /// Full lowercase hex encoding, as stored in trust lists
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short human-comparable digest of the key.
    ///
    /// `fingerprint = hex(BLAKE3("meshchat-fp" || key)[..8])` grouped in fours.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"meshchat-fp");
        hasher.update(&self.0);
        let digest = hex::encode(&hasher.finalize().as_bytes()[..8]);
        digest
            .as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// A peer's current location plus its durable identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// Last observed network address
    pub addr: IpAddr,
    /// Long-term public key
    pub id: PeerId,
}

impl Peer {
    pub fn new(addr: IpAddr, id: PeerId) -> Self {
        Self { addr, id }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

// =============================================================================
// TRUST
// =============================================================================

/// Public keys permitted to complete a handshake
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustSet {
    keys: HashSet<PeerId>,
}

impl TrustSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a key may complete a handshake
    pub fn contains(&self, id: &PeerId) -> bool {
        self.keys.contains(id)
    }

    /// Trust one more key
    pub fn insert(&mut self, id: PeerId) -> bool {
        self.keys.insert(id)
    }

    /// Union of this set and another
    pub fn union(&self, other: &TrustSet) -> TrustSet {
        TrustSet {
            keys: self.keys.union(&other.keys).copied().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerId> {
        self.keys.iter()
    }
}

impl FromIterator<PeerId> for TrustSet {
    fn from_iter<I: IntoIterator<Item = PeerId>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

impl Extend<PeerId> for TrustSet {
    fn extend<I: IntoIterator<Item = PeerId>>(&mut self, iter: I) {
        self.keys.extend(iter);
    }
}

// =============================================================================
// CONTROL CODES
// =============================================================================

/// Reserved gossip control codes.
///
/// Carried as a bare 2-byte big-endian plaintext before encryption. A
/// decrypted payload is a control code only on an exact match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ControlCode {
    /// Nothing to send back
    None = 0,
    /// Neighbour request or reply
    Neighbours = 1,
    /// Unsolicited new peer alert
    NewPeer = 2,
    /// Known peers request or reply
    KnownPeers = 4,
}

impl ControlCode {
    /// Wire bytes of this code
    pub fn to_bytes(self) -> [u8; 2] {
        (self as u16).to_be_bytes()
    }

    /// Classify a decrypted payload, `None` for application messages
    pub fn classify(payload: &[u8]) -> Option<Self> {
        Self::try_from(payload).ok()
    }
}

impl TryFrom<&[u8]> for ControlCode {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let raw: [u8; 2] = value
            .try_into()
            .map_err(|_| Error::NotAControlCode(value.to_vec()))?;
        match u16::from_be_bytes(raw) {
            0 => Ok(Self::None),
            1 => Ok(Self::Neighbours),
            2 => Ok(Self::NewPeer),
            4 => Ok(Self::KnownPeers),
            _ => Err(Error::NotAControlCode(value.to_vec())),
        }
    }
}

//! Lifecycle events surfaced to presentation layers

use meshchat_core::Peer;
use std::fmt;
use std::net::IpAddr;
use tokio::sync::mpsc;

/// Event from the overlay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    /// Bootstrap through the given address completed
    Joined(IpAddr),
    /// A previously unknown peer was announced by gossip
    PeerJoined(Peer),
    /// An outbound connection was established
    Connected(Peer),
    /// An inbound connection was accepted
    PeerConnected(Peer),
    /// A connection's receive loop ended
    PeerDisconnected(Peer),
    /// A known-peer reply from the given address was merged
    ReceivedPeers(IpAddr),
}

impl fmt::Display for OverlayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayEvent::Joined(addr) => write!(f, "joined network via {}", addr),
            OverlayEvent::PeerJoined(peer) => write!(f, "peer joined: {}", peer),
            OverlayEvent::Connected(peer) => write!(f, "connected to {}", peer),
            OverlayEvent::PeerConnected(peer) => write!(f, "peer connected: {}", peer),
            OverlayEvent::PeerDisconnected(peer) => write!(f, "peer disconnected: {}", peer),
            OverlayEvent::ReceivedPeers(addr) => write!(f, "received known peers from {}", addr),
        }
    }
}

/// Receiving end handed to the presentation layer
pub type EventReceiver = mpsc::UnboundedReceiver<OverlayEvent>;

/// Sending end owned by the overlay
pub(crate) type EventSender = mpsc::UnboundedSender<OverlayEvent>;

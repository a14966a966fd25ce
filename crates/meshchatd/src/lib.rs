//! meshchatd - encrypted peer-to-peer chat overlay
//!
//! This crate provides:
//! - Connection lifecycle over authenticated secure channels
//! - A bounded neighbour set and a registry of every known peer
//! - Gossip of neighbour lists, known peers and newly joined peers
//! - Identity and trust-list files

pub mod config;
pub mod events;
pub mod overlay;
pub mod registry;
pub mod storage;

pub use config::{Config, OverlayConfig, MESHCHAT_PORT};
pub use events::{EventReceiver, OverlayEvent};
pub use overlay::{Connection, Dispatcher, Overlay, OverlayError};
pub use registry::{KnownPeers, NeighbourInsert, NeighbourSet, Registry, MAX_NEIGHBOURS};
pub use storage::{KeyStore, StorageError};

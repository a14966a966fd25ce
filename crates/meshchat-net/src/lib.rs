//! Networking primitives for the meshchat overlay
//!
//! This crate provides:
//! - Identity keypair management
//! - Ephemeral key agreement and session encryption
//! - Length-prefixed message framing
//! - The authenticated `SecureChannel` handshake and transport

pub mod channel;
pub mod crypto;
pub mod framing;

pub use channel::{ChannelError, ChannelReader, ChannelWriter, Role, SecureChannel};
pub use crypto::{EphemeralKeyExchange, KeyPair, SessionKey};
pub use framing::FrameCodec;

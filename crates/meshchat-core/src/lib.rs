//! meshchat core library
//!
//! This crate provides the shared types and the canonical encoding used by
//! the meshchat overlay's gossip control protocol.
//!
//! # Modules
//!
//! - [`types`]: Peer identity, trust set and control codes
//! - [`canonical`]: postcard encoding of gossip payloads
//! - [`error`]: Error types

pub mod canonical;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

//! Error types for meshchat core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// meshchat core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Public key bytes of the wrong length or encoding
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Payload did not match any reserved control code
    #[error("not a control code: {0:02x?}")]
    NotAControlCode(Vec<u8>),
}

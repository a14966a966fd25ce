//! Identity key and trust-list files
//!
//! Layout of the key directory:
//! - `self`: hex-encoded Ed25519 seed
//! - `self.pub`: hex-encoded public key
//! - `trusted`: newline-delimited hex public keys

use meshchat_core::{PeerId, TrustSet};
use meshchat_net::KeyPair;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid key in {path}: {reason}")]
    InvalidKey { path: PathBuf, reason: String },
    #[error("No identity in {0}, create one first")]
    MissingIdentity(PathBuf),
}

/// File-backed identity and trust store
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// Open a key directory, creating it if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn private_path(&self) -> PathBuf {
        self.dir.join("self")
    }

    fn public_path(&self) -> PathBuf {
        self.dir.join("self.pub")
    }

    fn trusted_path(&self) -> PathBuf {
        self.dir.join("trusted")
    }

    /// Generate and persist a new identity, replacing any existing one
    pub fn create_identity(&self) -> Result<KeyPair, StorageError> {
        let keypair = KeyPair::generate();
        fs::write(self.private_path(), hex::encode(keypair.seed()))?;
        fs::write(self.public_path(), keypair.peer_id().to_hex())?;
        info!("created identity {}", keypair.peer_id());
        Ok(keypair)
    }

    /// Load the persisted identity
    pub fn load_identity(&self) -> Result<KeyPair, StorageError> {
        let path = self.private_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::MissingIdentity(self.dir.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let bytes = hex::decode(text.trim()).map_err(|e| StorageError::InvalidKey {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| StorageError::InvalidKey {
            path,
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        })?;

        Ok(KeyPair::from_seed(&seed))
    }

    /// Persisted public key bytes, as sent during the handshake
    pub fn public_key(&self) -> Result<PeerId, StorageError> {
        let path = self.public_path();
        let text = fs::read_to_string(&path)?;
        text.parse().map_err(|e: meshchat_core::Error| StorageError::InvalidKey {
            path,
            reason: e.to_string(),
        })
    }

    /// Read the trust list; a missing file is an empty list
    pub fn read_trusted_keys(&self) -> Result<TrustSet, StorageError> {
        let path = self.trusted_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(TrustSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut trusted = TrustSet::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let id: PeerId = line.parse().map_err(|e: meshchat_core::Error| StorageError::InvalidKey {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            trusted.insert(id);
        }
        debug!("read {} trusted keys", trusted.len());
        Ok(trusted)
    }

    /// Append a key to the trust list
    pub fn add_trusted_key(&self, id: &PeerId) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.trusted_path())?;
        writeln!(file, "{}", id.to_hex())?;
        Ok(())
    }
}

/// Read the newline-delimited bootstrap address list; missing file is empty
pub fn read_known_networks(path: impl AsRef<Path>) -> Result<Vec<String>, StorageError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

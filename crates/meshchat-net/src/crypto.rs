//! Cryptographic primitives for network layer
//!
//! Provides identity keys, ephemeral ECDH, session key derivation and the
//! authenticated token format used for every encrypted frame.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use meshchat_core::PeerId;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, SharedSecret};

/// First byte of every sealed token
pub const TOKEN_VERSION: u8 = 0x80;

/// Nonce length for ChaCha20-Poly1305
const NONCE_LEN: usize = 12;

/// version || issued_at || nonce
const TOKEN_HEADER_LEN: usize = 1 + 8 + NONCE_LEN;

/// Poly1305 tag length
const TAG_LEN: usize = 16;

/// Tolerated clock skew for tokens stamped in the future
const MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Key exchange produced a non-contributory secret")]
    NonContributory,
    #[error("Token expired (issued {issued_at})")]
    Expired { issued_at: u64 },
}

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Seed bytes for persisting the identity
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Public key as a peer identifier
    pub fn peer_id(&self) -> PeerId {
        PeerId(self.public_key())
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature
    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let sig = Signature::from_bytes(signature);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Symmetric key shared by both ends of one channel
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; 32],
}

/// A successfully opened token
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenedToken {
    /// Seconds since the unix epoch at which the sender sealed it
    pub issued_at: u64,
    pub plaintext: Vec<u8>,
}

impl SessionKey {
    /// Derive the session key from an ECDH shared secret.
    ///
    /// `key = HKDF-SHA256(salt = none, ikm = shared, info = "")[..32]`
    pub fn derive(shared_secret: &SharedSecret) -> Result<Self, CryptoError> {
        if !shared_secret.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Self::derive_from_secret(shared_secret.as_bytes())
    }

    /// Derive from raw secret bytes
    pub fn derive_from_secret(secret: &[u8]) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(None, secret);
        let mut key = [0u8; 32];
        hkdf.expand(&[], &mut key)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(Self { key })
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Encrypt a message into a self-describing token.
    ///
    /// Wire format:
    /// - 1 byte: version (0x80)
    /// - 8 bytes: issued-at unix seconds (big-endian)
    /// - 12 bytes: random nonce
    /// - N bytes: ciphertext with 16-byte tag over the header as AAD
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.seal_at(plaintext, unix_now())
    }

    fn seal_at(&self, plaintext: &[u8], issued_at: u64) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let mut token = Vec::with_capacity(TOKEN_HEADER_LEN + plaintext.len() + TAG_LEN);
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&issued_at.to_be_bytes());
        token.extend_from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &token,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        token.extend_from_slice(&ciphertext);
        Ok(token)
    }

    /// Decrypt a token produced by [`SessionKey::seal`]
    pub fn open(&self, token: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.open_token(token).map(|opened| opened.plaintext)
    }

    /// Decrypt a token and return its freshness stamp with the plaintext
    pub fn open_token(&self, token: &[u8]) -> Result<OpenedToken, CryptoError> {
        if token.len() < TOKEN_HEADER_LEN + TAG_LEN || token[0] != TOKEN_VERSION {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        let (header, ciphertext) = token.split_at(TOKEN_HEADER_LEN);
        let mut issued = [0u8; 8];
        issued.copy_from_slice(&header[1..9]);
        let nonce = Nonce::from_slice(&header[9..]);

        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(OpenedToken {
            issued_at: u64::from_be_bytes(issued),
            plaintext,
        })
    }

    /// Decrypt a token, rejecting it when older than `max_age`
    pub fn open_with_max_age(&self, token: &[u8], max_age: Duration) -> Result<Vec<u8>, CryptoError> {
        let opened = self.open_token(token)?;
        let now = unix_now();
        let too_old = now.saturating_sub(opened.issued_at) > max_age.as_secs();
        let too_new = opened.issued_at > now + MAX_CLOCK_SKEW.as_secs();
        if too_old || too_new {
            return Err(CryptoError::Expired {
                issued_at: opened.issued_at,
            });
        }
        Ok(opened.plaintext)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// X25519 ephemeral key exchange
pub struct EphemeralKeyExchange {
    secret: EphemeralSecret,
    public: X25519Public,
}

impl EphemeralKeyExchange {
    /// Generate new ephemeral keypair
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Perform key exchange and derive shared secret
    pub fn exchange(self, their_public: &[u8; 32]) -> SharedSecret {
        let their_public = X25519Public::from(*their_public);
        self.secret.diffie_hellman(&their_public)
    }
}

impl Default for EphemeralKeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

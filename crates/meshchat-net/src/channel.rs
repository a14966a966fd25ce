//! Authenticated, encrypted channel over one stream connection
//!
//! Handshake (every step is one length-prefixed frame):
//! 1. Identity exchange. The initiator sends its long-term public key first
//!    and then reads the remote key; the acceptor reads, validates, then
//!    sends. A key outside the trusted set aborts with `Authentication`.
//! 2. Ephemeral agreement. Each side signs a fresh X25519 public point with
//!    its identity key and sends (signature, point); the initiator sends
//!    first. A signature that does not verify against the already
//!    authenticated identity aborts with `Integrity`.
//! 3. `session = HKDF-SHA256(DH(local ephemeral, remote ephemeral))`, derived
//!    once and cached for the life of the channel.
//!
//! After the handshake every frame is a sealed token under the session key.

use crate::crypto::{CryptoError, EphemeralKeyExchange, KeyPair, SessionKey};
use crate::framing::{FrameCodec, FrameError};
use futures::{SinkExt, StreamExt};
use meshchat_core::{PeerId, TrustSet};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

/// Channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Untrusted identity key: {0}")]
    Authentication(String),
    #[error("Ephemeral key signature verification failed")]
    Integrity,
    #[error("Frame decryption failed")]
    Decryption,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Frame error: {0}")]
    Frame(FrameError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Crypto error: {0}")]
    Crypto(CryptoError),
}

impl From<FrameError> for ChannelError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => ChannelError::Io(e),
            other => ChannelError::Frame(other),
        }
    }
}

impl From<CryptoError> for ChannelError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed => ChannelError::Decryption,
            CryptoError::SignatureVerificationFailed
            | CryptoError::InvalidKeyLength
            | CryptoError::NonContributory => ChannelError::Integrity,
            other => ChannelError::Crypto(other),
        }
    }
}

impl ChannelError {
    /// Whether this error is the peer going away rather than a fault
    pub fn is_disconnect(&self) -> bool {
        match self {
            ChannelError::ConnectionClosed => true,
            ChannelError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Which side of the handshake this end plays
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection, speaks first
    Initiator,
    /// Accepted the connection, listens first
    Acceptor,
}

/// Receiving half of an established channel
pub struct ChannelReader<S = TcpStream> {
    inner: FramedRead<ReadHalf<S>, FrameCodec>,
    session: SessionKey,
    peer_id: PeerId,
}

/// Sending half of an established channel
pub struct ChannelWriter<S = TcpStream> {
    inner: FramedWrite<WriteHalf<S>, FrameCodec>,
    session: SessionKey,
    peer_id: PeerId,
}

/// An established secure channel
pub struct SecureChannel<S = TcpStream> {
    reader: ChannelReader<S>,
    writer: ChannelWriter<S>,
    role: Role,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the handshake over a connected stream.
    ///
    /// On failure the stream is dropped and nothing is returned, so a failed
    /// handshake can never be registered as a connection.
    pub async fn handshake(
        stream: S,
        role: Role,
        identity: &KeyPair,
        trusted: &TrustSet,
    ) -> Result<Self, ChannelError> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, FrameCodec::new());
        let mut writer = FramedWrite::new(write_half, FrameCodec::new());

        // Identity exchange
        let own_key = identity.public_key();
        let peer_id = match role {
            Role::Initiator => {
                send_frame(&mut writer, &own_key).await?;
                let remote = recv_frame(&mut reader).await?;
                authenticate(&remote, trusted)?
            }
            Role::Acceptor => {
                let remote = recv_frame(&mut reader).await?;
                let peer_id = authenticate(&remote, trusted)?;
                send_frame(&mut writer, &own_key).await?;
                peer_id
            }
        };
        debug!("handshake: authenticated identity {}", peer_id);

        // Ephemeral agreement
        let exchange = EphemeralKeyExchange::new();
        let ephemeral_public = exchange.public_key();
        let signature = identity.sign(&ephemeral_public);

        let (remote_signature, remote_point) = match role {
            Role::Initiator => {
                send_frames(&mut writer, &[&signature[..], &ephemeral_public[..]]).await?;
                let sig = recv_frame(&mut reader).await?;
                let point = recv_frame(&mut reader).await?;
                (sig, point)
            }
            Role::Acceptor => {
                let sig = recv_frame(&mut reader).await?;
                let point = recv_frame(&mut reader).await?;
                send_frames(&mut writer, &[&signature[..], &ephemeral_public[..]]).await?;
                (sig, point)
            }
        };

        let remote_point = verify_ephemeral(&peer_id, &remote_signature, &remote_point)?;
        debug!("handshake: verified ephemeral key of {}", peer_id);

        let shared = exchange.exchange(&remote_point);
        let session = SessionKey::derive(&shared)?;

        Ok(Self {
            reader: ChannelReader {
                inner: reader,
                session: session.clone(),
                peer_id,
            },
            writer: ChannelWriter {
                inner: writer,
                session,
                peer_id,
            },
            role,
        })
    }

    /// Run the handshake, giving up after `timeout`
    pub async fn handshake_with_timeout(
        stream: S,
        role: Role,
        identity: &KeyPair,
        trusted: &TrustSet,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        tokio::time::timeout(timeout, Self::handshake(stream, role, identity, trusted))
            .await
            .map_err(|_| ChannelError::HandshakeTimeout(timeout))?
    }

    /// The authenticated long-term key of the remote end
    pub fn peer_id(&self) -> PeerId {
        self.reader.peer_id
    }

    /// The role this end played in the handshake
    pub fn role(&self) -> Role {
        self.role
    }

    /// The cached session key
    pub fn session_key(&self) -> &SessionKey {
        &self.reader.session
    }

    /// Encrypt and send one message
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        self.writer.send(payload).await
    }

    /// Receive and decrypt one message
    pub async fn receive(&mut self) -> Result<Vec<u8>, ChannelError> {
        self.reader.receive().await
    }

    /// Split into independently owned halves
    pub fn into_split(self) -> (ChannelReader<S>, ChannelWriter<S>) {
        (self.reader, self.writer)
    }

    /// Close the channel.
    ///
    /// Drops the read half, then flushes and shuts down the write direction.
    /// The peer sees end of stream on its next receive; the socket itself is
    /// released once both halves are gone. Split stream halves cannot shut
    /// down reading, so unread inbound data is discarded with the read half
    /// rather than refused by a read-side shutdown.
    pub async fn close(self) -> Result<(), ChannelError> {
        let (reader, mut writer) = self.into_split();
        drop(reader);
        writer.close().await
    }
}

impl<S> ChannelReader<S>
where
    S: AsyncRead + Unpin,
{
    /// Receive and decrypt one message.
    ///
    /// End of stream yields `ConnectionClosed`; a tag failure yields
    /// `Decryption` and the channel must not be used further.
    pub async fn receive(&mut self) -> Result<Vec<u8>, ChannelError> {
        let token = recv_frame(&mut self.inner).await?;
        Ok(self.session.open(&token)?)
    }

    /// The authenticated long-term key of the remote end
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

impl<S> ChannelWriter<S>
where
    S: AsyncWrite + Unpin,
{
    /// Encrypt and send one message
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        let token = self.session.seal(payload)?;
        send_frame(&mut self.inner, &token).await
    }

    /// Encrypt and send several messages back-to-back with a single flush
    pub async fn send_all(&mut self, payloads: &[&[u8]]) -> Result<(), ChannelError> {
        let tokens = payloads
            .iter()
            .map(|p| self.session.seal(p))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&[u8]> = tokens.iter().map(Vec::as_slice).collect();
        send_frames(&mut self.inner, &refs).await
    }

    /// The authenticated long-term key of the remote end
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Flush and shut down the write direction.
    ///
    /// The read direction stays open; the underlying socket closes when the
    /// matching [`ChannelReader`] is dropped as well.
    pub async fn close(&mut self) -> Result<(), ChannelError> {
        SinkExt::<&[u8]>::close(&mut self.inner).await?;
        Ok(())
    }
}

fn authenticate(remote: &[u8], trusted: &TrustSet) -> Result<PeerId, ChannelError> {
    let peer_id =
        PeerId::from_slice(remote).map_err(|_| ChannelError::Authentication(hex::encode(remote)))?;
    if !trusted.contains(&peer_id) {
        return Err(ChannelError::Authentication(peer_id.to_hex()));
    }
    Ok(peer_id)
}

fn verify_ephemeral(
    peer_id: &PeerId,
    signature: &[u8],
    point: &[u8],
) -> Result<[u8; 32], ChannelError> {
    let signature: [u8; 64] = signature.try_into().map_err(|_| ChannelError::Integrity)?;
    let point: [u8; 32] = point.try_into().map_err(|_| ChannelError::Integrity)?;
    KeyPair::verify(peer_id.as_bytes(), &point, &signature)?;
    Ok(point)
}

async fn recv_frame<R>(reader: &mut FramedRead<R, FrameCodec>) -> Result<Vec<u8>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    match reader.next().await {
        Some(frame) => Ok(frame?),
        None => Err(ChannelError::ConnectionClosed),
    }
}

async fn send_frame<W>(writer: &mut FramedWrite<W, FrameCodec>, payload: &[u8]) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    writer.send(payload).await?;
    Ok(())
}

async fn send_frames<W>(
    writer: &mut FramedWrite<W, FrameCodec>,
    payloads: &[&[u8]],
) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    for payload in payloads {
        writer.feed(*payload).await?;
    }
    SinkExt::<&[u8]>::flush(writer).await?;
    Ok(())
}

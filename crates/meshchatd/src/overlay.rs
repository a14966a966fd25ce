//! Overlay: connection lifecycle, registries and the gossip control protocol
//!
//! Each connection runs one receive loop. A decrypted frame that exactly
//! matches a control code is handled here; anything else goes to the
//! connection's dispatcher.
//!
//! Request/reply pairing is explicit: before sending `NEIGHBOURS` or
//! `KNOWNPEERS` as a request the sender takes the connection's request lock
//! and records what it is waiting for. The receive loop treats a matching
//! code as the reply only while that conversation is open, and as a request
//! from the remote otherwise. `NONE` closes whatever conversation is open.

use crate::config::OverlayConfig;
use crate::events::{EventReceiver, EventSender, OverlayEvent};
use crate::registry::Registry;
use crate::storage::{self, StorageError};
use meshchat_core::canonical::{
    decode_known_peers, decode_neighbours, decode_new_peer, encode_known_peers,
    encode_neighbours, encode_new_peer,
};
use meshchat_core::{ControlCode, Peer, PeerId, TrustSet};
use meshchat_net::{ChannelError, ChannelReader, ChannelWriter, KeyPair, Role, SecureChannel};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Messages held for a connection that has no dispatcher yet
const MAX_BACKLOG: usize = 256;

/// Overlay errors
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Encoding error: {0}")]
    Encoding(#[from] meshchat_core::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Listener closed")]
    ListenerClosed,
    #[error("Already listening")]
    AlreadyListening,
    #[error("Not connected to {0}")]
    NotConnected(IpAddr),
    #[error("Connection to {0} lost before the reply arrived")]
    ReplyLost(IpAddr),
    #[error("Overlay stopped")]
    Stopped,
}

/// Application message handler for one connection
pub type Dispatcher = Arc<dyn Fn(&str) + Send + Sync>;

/// Control requests that expect a reply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Request {
    Neighbours,
    KnownPeers,
}

impl Request {
    fn code(self) -> ControlCode {
        match self {
            Request::Neighbours => ControlCode::Neighbours,
            Request::KnownPeers => ControlCode::KnownPeers,
        }
    }
}

/// What this end is waiting for on a connection
enum Conversation {
    Idle,
    Awaiting(Request, oneshot::Sender<()>),
}

/// Application handler, plus messages that arrived before it was set
#[derive(Default)]
struct Inbox {
    handler: Option<Dispatcher>,
    backlog: VecDeque<String>,
}

impl Inbox {
    /// Hold a message until a handler is installed; false if one was dropped
    fn queue(&mut self, text: String) -> bool {
        let overflow = self.backlog.len() == MAX_BACKLOG;
        if overflow {
            self.backlog.pop_front();
        }
        self.backlog.push_back(text);
        !overflow
    }

    /// Replay the backlog through `handler`, then keep it for later messages
    fn install(&mut self, handler: Dispatcher) {
        for text in self.backlog.drain(..) {
            handler(&text);
        }
        self.handler = Some(handler);
    }
}

/// One live, authenticated connection
pub struct Connection {
    peer: Peer,
    role: Role,
    writer: AsyncMutex<ChannelWriter>,
    /// Held from sending a request until its reply is consumed
    request_lock: AsyncMutex<()>,
    conversation: Mutex<Conversation>,
    inbox: Mutex<Inbox>,
    closed: Notify,
    /// Cleared once the receive loop has exited
    alive: AtomicBool,
    /// Set when another channel to the same peer took this one's place
    superseded: AtomicBool,
}

impl Connection {
    fn new(peer: Peer, role: Role, writer: ChannelWriter) -> Self {
        Self {
            peer,
            role,
            writer: AsyncMutex::new(writer),
            request_lock: AsyncMutex::new(()),
            conversation: Mutex::new(Conversation::Idle),
            inbox: Mutex::new(Inbox::default()),
            closed: Notify::new(),
            alive: AtomicBool::new(true),
            superseded: AtomicBool::new(false),
        }
    }

    /// Remote address and identity
    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Which side opened the connection
    pub fn role(&self) -> Role {
        self.role
    }

    async fn send_frame(&self, payload: &[u8]) -> Result<(), ChannelError> {
        self.writer.lock().await.send(payload).await
    }

    /// Write frames back-to-back so nothing interleaves
    async fn send_frames(&self, payloads: &[&[u8]]) -> Result<(), ChannelError> {
        self.writer.lock().await.send_all(payloads).await
    }

    async fn send_code(&self, code: ControlCode) -> Result<(), ChannelError> {
        self.send_frame(&code.to_bytes()).await
    }

    fn awaiting(&self) -> Option<Request> {
        match &*self.conversation.lock() {
            Conversation::Idle => None,
            Conversation::Awaiting(request, _) => Some(*request),
        }
    }

    fn begin(&self, request: Request) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.conversation.lock() = Conversation::Awaiting(request, tx);
        rx
    }

    /// Close the open conversation, waking the requester
    fn finish(&self) -> bool {
        match std::mem::replace(&mut *self.conversation.lock(), Conversation::Idle) {
            Conversation::Awaiting(_, tx) => {
                let _ = tx.send(());
                true
            }
            Conversation::Idle => false,
        }
    }

    /// Drop the open conversation; the requester sees the reply as lost
    fn abandon(&self) {
        *self.conversation.lock() = Conversation::Idle;
    }

    /// Whether a receive loop is still serving this connection
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.abandon();
    }

    fn dispatch(&self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).into_owned();
        let mut inbox = self.inbox.lock();
        match inbox.handler.clone() {
            Some(handler) => {
                drop(inbox);
                handler(&text);
            }
            None => {
                if !inbox.queue(text) {
                    warn!("{}: no dispatcher, dropped oldest queued message", self.peer.addr);
                }
            }
        }
    }

    /// Install the handler and replay anything queued before it.
    ///
    /// Replay happens under the inbox lock so later messages cannot overtake
    /// queued ones.
    fn set_dispatcher(&self, handler: Dispatcher) {
        self.inbox.lock().install(handler);
    }

    /// Retire this channel in favour of another one to the same peer
    fn supersede(&self) {
        self.superseded.store(true, Ordering::SeqCst);
        self.close();
    }

    async fn next_frame(&self, reader: &mut ChannelReader) -> Result<Vec<u8>, ChannelError> {
        tokio::select! {
            biased;
            _ = self.closed.notified() => Err(ChannelError::ConnectionClosed),
            frame = reader.receive() => frame,
        }
    }

    /// Stop the receive loop
    fn close(&self) {
        self.closed.notify_one();
    }

    /// Stop the receive loop and shut down the write direction
    async fn shutdown(&self) {
        self.close();
        if let Err(e) = self.writer.lock().await.close().await {
            debug!("{}: close failed: {}", self.peer.addr, e);
        }
        debug!("closed connection to {}", self.peer.addr);
    }
}

/// The overlay node
pub struct Overlay {
    config: OverlayConfig,
    identity: KeyPair,
    /// Long-term trust read from the key store
    file_trust: TrustSet,
    registry: Mutex<Registry>,
    connections: RwLock<HashMap<IpAddr, Arc<Connection>>>,
    events: EventSender,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
    /// Handshakes in flight per address
    pending: Mutex<HashMap<IpAddr, usize>>,
}

/// Marks a handshake to an address as in flight until dropped
struct PendingHandshake<'a> {
    pending: &'a Mutex<HashMap<IpAddr, usize>>,
    addr: IpAddr,
}

impl Drop for PendingHandshake<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if let Some(count) = pending.get_mut(&self.addr) {
            *count -= 1;
            if *count == 0 {
                pending.remove(&self.addr);
            }
        }
    }
}

impl Overlay {
    /// Create an overlay and the receiver for its lifecycle events
    pub fn new(
        config: OverlayConfig,
        identity: KeyPair,
        file_trust: TrustSet,
    ) -> (Arc<Self>, EventReceiver) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let overlay = Arc::new(Self {
            config,
            identity,
            file_trust,
            registry: Mutex::new(Registry::new()),
            connections: RwLock::new(HashMap::new()),
            events,
            accept_task: Mutex::new(None),
            shutdown_tx,
            stopped: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        });
        (overlay, events_rx)
    }

    /// Our long-term public key
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    fn emit(&self, event: OverlayEvent) {
        debug!("event: {}", event);
        let _ = self.events.send(event);
    }

    fn ensure_running(&self) -> Result<(), OverlayError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(OverlayError::Stopped);
        }
        Ok(())
    }

    fn track_handshake(&self, addr: IpAddr) -> PendingHandshake<'_> {
        *self.pending.lock().entry(addr).or_insert(0) += 1;
        PendingHandshake {
            pending: &self.pending,
            addr,
        }
    }

    fn handshake_pending(&self, addr: IpAddr) -> bool {
        self.pending.lock().contains_key(&addr)
    }

    /// Key of the node that opened a channel
    fn initiator(&self, conn: &Connection) -> PeerId {
        match conn.role {
            Role::Initiator => self.peer_id(),
            Role::Acceptor => conn.peer.id,
        }
    }

    /// Both ends keep the channel opened by the lower key. A channel from the
    /// same opener is a reconnect and wins.
    fn supersedes(&self, new: &Connection, existing: &Connection) -> bool {
        self.initiator(new) <= self.initiator(existing)
    }

    /// Keys allowed to complete a handshake: file trust plus every known peer
    pub fn trust_set(&self) -> TrustSet {
        let known = self.registry.lock().known.ids();
        self.file_trust.union(&known)
    }

    // =========================================================================
    // LISTENING
    // =========================================================================

    /// Bind the overlay port and start accepting peers
    pub fn start_listening(self: &Arc<Self>) -> Result<SocketAddr, OverlayError> {
        self.ensure_running()?;

        let mut slot = self.accept_task.lock();
        if slot.is_some() {
            return Err(OverlayError::AlreadyListening);
        }

        let listener = self.bind_listener()?;
        let local = listener.local_addr()?;
        let shutdown_rx = self.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(Arc::clone(self).accept_loop(listener, shutdown_rx)));

        info!("serving peers on {}", local);
        Ok(local)
    }

    pub fn is_listening(&self) -> bool {
        self.accept_task.lock().is_some()
    }

    fn bind_listener(&self) -> io::Result<TcpListener> {
        let addr = SocketAddr::new(self.config.listen_ip, self.config.port);
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(1024)
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            match Self::accept_peer(&listener, &mut shutdown_rx).await {
                Ok((stream, remote)) => {
                    let addr = canonical_ip(remote.ip());
                    debug!("accepted connection from {}", addr);
                    let overlay = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = overlay.admit(stream, addr).await {
                            warn!("{}: rejected: {}", addr, e);
                        }
                    });
                }
                Err(OverlayError::ListenerClosed) => {
                    debug!("stopped serving peers");
                    break;
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn accept_peer(
        listener: &TcpListener,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(TcpStream, SocketAddr), OverlayError> {
        tokio::select! {
            result = listener.accept() => Ok(result?),
            _ = shutdown_rx.recv() => Err(OverlayError::ListenerClosed),
        }
    }

    /// Handshake as acceptor and register the new connection
    async fn admit(self: &Arc<Self>, stream: TcpStream, addr: IpAddr) -> Result<Peer, OverlayError> {
        let pending = self.track_handshake(addr);
        let trust = self.trust_set();
        let channel = SecureChannel::handshake_with_timeout(
            stream,
            Role::Acceptor,
            &self.identity,
            &trust,
            self.config.handshake_timeout,
        )
        .await?;
        self.ensure_running()?;

        let peer = Peer::new(addr, channel.peer_id());

        // New peers are announced before they take a neighbour slot
        let is_new = self.registry.lock().known.insert(peer.id, peer.addr).is_none();
        if is_new {
            debug!("{} is a new invitee, alerting", peer);
            self.alert_new_peer(addr, peer).await;
        }

        self.registry.lock().neighbours.insert(peer);
        let (_, kept) = self.register(channel, peer, pending);
        if kept {
            info!("{}: connection established", addr);
            self.emit(OverlayEvent::PeerConnected(peer));
        }
        Ok(peer)
    }

    // =========================================================================
    // CONNECTING
    // =========================================================================

    /// Connect, fetch neighbours and known peers, then start serving
    pub async fn join(self: &Arc<Self>, addr: IpAddr) -> Result<(), OverlayError> {
        self.connect(addr).await?;
        self.request_neighbours(addr).await?;
        self.request_known_peers(addr).await?;

        if !self.is_listening() {
            self.start_listening()?;
        }

        info!("joined network via {}", addr);
        self.emit(OverlayEvent::Joined(addr));
        Ok(())
    }

    /// Open an authenticated connection to `addr`
    pub async fn connect(self: &Arc<Self>, addr: IpAddr) -> Result<Peer, OverlayError> {
        let conn = self.open(addr).await?;
        self.emit(OverlayEvent::Connected(conn.peer()));
        Ok(conn.peer())
    }

    async fn open(self: &Arc<Self>, addr: IpAddr) -> Result<Arc<Connection>, OverlayError> {
        self.ensure_running()?;
        let pending = self.track_handshake(addr);
        debug!("connecting to {}", addr);

        let stream = self.dial(addr).await?;
        let trust = self.trust_set();
        let channel = SecureChannel::handshake_with_timeout(
            stream,
            Role::Initiator,
            &self.identity,
            &trust,
            self.config.handshake_timeout,
        )
        .await?;
        self.ensure_running()?;

        let peer = Peer::new(addr, channel.peer_id());
        self.registry.lock().record_connected(peer);

        let (conn, kept) = self.register(channel, peer, pending);
        if kept {
            info!("{}: connection established", addr);
        }
        Ok(conn)
    }

    async fn dial(&self, addr: IpAddr) -> io::Result<TcpStream> {
        let target = SocketAddr::new(addr, self.config.port);
        let socket = match addr {
            IpAddr::V4(_) => TcpSocket::new_v4()?,
            IpAddr::V6(_) => TcpSocket::new_v6()?,
        };

        // Originate from our listen address so the acceptor records the
        // address we can be reached at
        let local = self.config.listen_ip;
        if !local.is_unspecified() && local.is_ipv4() == addr.is_ipv4() {
            socket.bind(SocketAddr::new(local, 0))?;
        }

        match tokio::time::timeout(self.config.handshake_timeout, socket.connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out", target),
            )),
        }
    }

    /// Store the connection and spawn its receive loop.
    ///
    /// When a live channel to the same peer already exists only one of the
    /// two survives, chosen identically on both ends. Returns the surviving
    /// connection and whether it is the new one. The handshake stops counting
    /// as pending in the same critical section that stores the channel.
    fn register(
        self: &Arc<Self>,
        channel: SecureChannel,
        peer: Peer,
        pending: PendingHandshake<'_>,
    ) -> (Arc<Connection>, bool) {
        let role = channel.role();
        let (reader, writer) = channel.into_split();
        let conn = Arc::new(Connection::new(peer, role, writer));

        let replaced = {
            let mut connections = self.connections.write();
            if let Some(existing) = connections.get(&peer.addr) {
                if existing.is_alive()
                    && existing.peer.id == peer.id
                    && !self.supersedes(&conn, existing)
                {
                    debug!("{}: keeping existing channel, dropping duplicate", peer.addr);
                    let existing = Arc::clone(existing);
                    drop(pending);
                    return (existing, false);
                }
            }
            let replaced = connections.insert(peer.addr, Arc::clone(&conn));
            drop(pending);
            replaced
        };
        if let Some(old) = replaced {
            debug!("{}: replacing existing channel", peer.addr);
            let handler = old.inbox.lock().handler.clone();
            if let Some(handler) = handler {
                conn.set_dispatcher(handler);
            }
            old.supersede();
        }

        tokio::spawn(Arc::clone(self).receive_loop(Arc::clone(&conn), reader));
        (conn, true)
    }

    /// Existing connection to `addr`, if any
    pub fn connection(&self, addr: IpAddr) -> Option<Arc<Connection>> {
        self.connections.read().get(&addr).cloned()
    }

    async fn connection_or_connect(
        self: &Arc<Self>,
        addr: IpAddr,
    ) -> Result<Arc<Connection>, OverlayError> {
        if let Some(conn) = self.connection(addr).filter(|c| c.is_alive()) {
            return Ok(conn);
        }
        let conn = self.open(addr).await?;
        self.emit(OverlayEvent::Connected(conn.peer()));
        Ok(conn)
    }

    // =========================================================================
    // REQUESTS AND MESSAGES
    // =========================================================================

    /// Ask `addr` for its neighbours and wait until the reply is merged
    pub async fn request_neighbours(self: &Arc<Self>, addr: IpAddr) -> Result<(), OverlayError> {
        let conn = self.connection_or_connect(addr).await?;
        self.request(&conn, Request::Neighbours).await
    }

    /// Ask `addr` for its known peers and wait until the reply is merged
    pub async fn request_known_peers(self: &Arc<Self>, addr: IpAddr) -> Result<(), OverlayError> {
        let conn = self.connection_or_connect(addr).await?;
        self.request(&conn, Request::KnownPeers).await
    }

    async fn request(&self, conn: &Connection, request: Request) -> Result<(), OverlayError> {
        let _request = conn.request_lock.lock().await;
        let reply = conn.begin(request);
        if !conn.is_alive() {
            conn.abandon();
            return Err(OverlayError::ReplyLost(conn.peer.addr));
        }

        debug!("requesting {:?} from {}", request, conn.peer.addr);
        if let Err(e) = conn.send_code(request.code()).await {
            conn.abandon();
            return Err(e.into());
        }

        reply.await.map_err(|_| OverlayError::ReplyLost(conn.peer.addr))
    }

    /// Send a text message, connecting first if needed
    pub async fn send(self: &Arc<Self>, addr: IpAddr, text: &str) -> Result<(), OverlayError> {
        let conn = self.connection_or_connect(addr).await?;
        let _request = conn.request_lock.lock().await;
        conn.send_frame(text.as_bytes()).await?;
        Ok(())
    }

    /// Route application messages from `addr` to `dispatcher`
    pub fn set_dispatcher<F>(&self, addr: IpAddr, dispatcher: F) -> Result<(), OverlayError>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let conn = self.connection(addr).ok_or(OverlayError::NotConnected(addr))?;
        conn.set_dispatcher(Arc::new(dispatcher));
        Ok(())
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Every peer ever learned, sorted by key
    pub fn known_peers(&self) -> Vec<Peer> {
        let mut peers = self.registry.lock().known.peers();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Current neighbours, oldest first
    pub fn neighbours(&self) -> Vec<Peer> {
        self.registry.lock().neighbours.to_vec()
    }

    /// Peers with a live connection
    pub fn connections(&self) -> Vec<Peer> {
        self.connections.read().values().map(|c| c.peer()).collect()
    }

    /// Bootstrap addresses from the known-networks file
    pub fn known_networks(&self) -> Result<Vec<String>, OverlayError> {
        Ok(storage::read_known_networks(&self.config.known_networks)?)
    }

    /// Close every connection and stop serving
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(());
        let accept = self.accept_task.lock().take();
        if let Some(handle) = accept {
            let _ = handle.await;
        }

        let connections: Vec<Arc<Connection>> =
            self.connections.write().drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.shutdown().await;
        }
        info!("overlay stopped");
    }

    // =========================================================================
    // RECEIVE LOOP AND GOSSIP
    // =========================================================================

    async fn receive_loop(self: Arc<Self>, conn: Arc<Connection>, mut reader: ChannelReader) {
        let addr = conn.peer.addr;

        loop {
            let frame = match conn.next_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(e) if e.is_disconnect() => break,
                Err(e) => {
                    warn!("{}: receive failed: {}", addr, e);
                    break;
                }
            };

            match self.handle_frame(&conn, &mut reader, frame).await {
                Ok(()) => {}
                Err(OverlayError::Encoding(e)) => {
                    warn!("{}: malformed gossip payload: {}", addr, e);
                }
                Err(OverlayError::Channel(e)) if e.is_disconnect() => break,
                Err(e) => {
                    warn!("{}: {}", addr, e);
                    break;
                }
            }
        }

        conn.mark_dead();
        let replaced = {
            let mut connections = self.connections.write();
            let current = connections.get(&addr).is_some_and(|c| Arc::ptr_eq(c, &conn));
            if current {
                connections.remove(&addr);
            }
            // A handshake in flight to the same address is about to take over
            current && self.handshake_pending(addr)
        };

        debug!("stopped listening for messages from {}", addr);
        if replaced || conn.superseded.load(Ordering::SeqCst) {
            debug!("{}: channel replaced, peer still reachable", addr);
            return;
        }
        self.emit(OverlayEvent::PeerDisconnected(conn.peer()));
    }

    async fn handle_frame(
        self: &Arc<Self>,
        conn: &Connection,
        reader: &mut ChannelReader,
        frame: Vec<u8>,
    ) -> Result<(), OverlayError> {
        match ControlCode::classify(&frame) {
            Some(ControlCode::Neighbours) => self.on_neighbours(conn, reader).await,
            Some(ControlCode::KnownPeers) => self.on_known_peers(conn, reader).await,
            Some(ControlCode::NewPeer) => self.on_new_peer(conn, reader).await,
            Some(ControlCode::None) => {
                if !conn.finish() {
                    debug!("{}: unsolicited none", conn.peer.addr);
                }
                Ok(())
            }
            None => {
                debug!("dispatching regular message...");
                conn.dispatch(&frame);
                Ok(())
            }
        }
    }

    async fn on_neighbours(
        &self,
        conn: &Connection,
        reader: &mut ChannelReader,
    ) -> Result<(), OverlayError> {
        if conn.awaiting() != Some(Request::Neighbours) {
            // The remote asked; reply without touching our own request lock
            let neighbours = self.registry.lock().neighbours.excluding(&conn.peer.id);
            if neighbours.is_empty() {
                conn.send_code(ControlCode::None).await?;
                debug!("sent none to {}", conn.peer.addr);
            } else {
                let code = ControlCode::Neighbours.to_bytes();
                let payload = encode_neighbours(&neighbours)?;
                conn.send_frames(&[code.as_slice(), payload.as_slice()]).await?;
                debug!("{} neighbours sent", neighbours.len());
            }
            return Ok(());
        }

        let payload = conn.next_frame(reader).await?;
        let entries = decode_neighbours(&payload);
        let own = self.peer_id();
        if let Ok(entries) = &entries {
            let mut registry = self.registry.lock();
            for peer in entries.iter().filter(|p| p.id != own) {
                registry.neighbours.insert(*peer);
            }
            debug!("neighbours are: {:?}", registry.neighbours.to_vec());
        }
        conn.finish();
        entries.map(|_| ()).map_err(OverlayError::from)
    }

    async fn on_known_peers(
        &self,
        conn: &Connection,
        reader: &mut ChannelReader,
    ) -> Result<(), OverlayError> {
        if conn.awaiting() != Some(Request::KnownPeers) {
            let peers = self.registry.lock().known.without(&conn.peer.id);
            if peers.is_empty() {
                conn.send_code(ControlCode::None).await?;
                debug!("sent none to {}", conn.peer.addr);
            } else {
                let code = ControlCode::KnownPeers.to_bytes();
                let payload = encode_known_peers(peers.iter().copied())?;
                conn.send_frames(&[code.as_slice(), payload.as_slice()]).await?;
                debug!("sent {} known peers", peers.len());
            }
            return Ok(());
        }

        let payload = conn.next_frame(reader).await?;
        let entries = decode_known_peers(&payload);
        let own = self.peer_id();
        if let Ok(entries) = &entries {
            let added = self
                .registry
                .lock()
                .known
                .merge(entries.iter().copied().filter(|p| p.id != own));
            debug!("received {} peers, {} new", entries.len(), added);
        }
        conn.finish();

        entries?;
        self.emit(OverlayEvent::ReceivedPeers(conn.peer.addr));
        Ok(())
    }

    async fn on_new_peer(
        self: &Arc<Self>,
        conn: &Connection,
        reader: &mut ChannelReader,
    ) -> Result<(), OverlayError> {
        let payload = conn.next_frame(reader).await?;
        let peer = decode_new_peer(&payload)?;
        if peer.id == self.peer_id() {
            return Ok(());
        }

        // Already known peers are only re-addressed; this is what ends a flood
        let previous = self.registry.lock().known.insert(peer.id, peer.addr);
        if previous.is_none() {
            debug!("added new peer {}", peer);
            self.emit(OverlayEvent::PeerJoined(peer));
            self.alert_new_peer(conn.peer.addr, peer).await;
        }
        Ok(())
    }

    /// Tell every neighbour except the new peer and its introducer
    async fn alert_new_peer(self: &Arc<Self>, introducer: IpAddr, new_peer: Peer) {
        let targets: Vec<Peer> = self
            .registry
            .lock()
            .neighbours
            .iter()
            .filter(|n| n.addr != new_peer.addr && n.addr != introducer)
            .copied()
            .collect();
        if targets.is_empty() {
            return;
        }

        let payload = match encode_new_peer(&new_peer) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode new peer {}: {}", new_peer, e);
                return;
            }
        };
        let code = ControlCode::NewPeer.to_bytes();

        for neighbour in targets {
            let result = match self.connection_or_connect(neighbour.addr).await {
                Ok(conn) => conn
                    .send_frames(&[code.as_slice(), payload.as_slice()])
                    .await
                    .map_err(OverlayError::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!("alerted neighbour {} of {}", neighbour.addr, new_peer.addr),
                Err(e) => warn!("failed to alert {} of {}: {}", neighbour.addr, new_peer.addr, e),
            }
        }
    }
}

/// Unwrap IPv4-mapped IPv6 addresses seen on dual-stack listeners
fn canonical_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}

//! Integration tests for the overlay over real loopback sockets.
//!
//! Every node in a test listens on its own loopback address (127.0.0.x) and
//! all of them share one port, the way overlay nodes share the well-known
//! port in a real deployment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meshchat_core::{Peer, TrustSet};
use meshchat_net::KeyPair;
use meshchatd::{EventReceiver, Overlay, OverlayConfig, OverlayError, OverlayEvent};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Atomic port counter so parallel tests never share a listener.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHORT_TIMEOUT: Duration = Duration::from_millis(500);

fn loopback(host: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, host))
}

struct TestNode {
    overlay: Arc<Overlay>,
    events: EventReceiver,
    addr: IpAddr,
    identity: KeyPair,
}

impl TestNode {
    fn new(host: u8, port: u16, identity: KeyPair, trust: TrustSet) -> Self {
        let config = OverlayConfig {
            listen_ip: loopback(host),
            port,
            handshake_timeout: Duration::from_secs(5),
            known_networks: PathBuf::from("./known_networks"),
        };
        let (overlay, events) = Overlay::new(config, identity.clone(), trust);
        Self {
            overlay,
            events,
            addr: loopback(host),
            identity,
        }
    }

    fn peer(&self) -> Peer {
        Peer::new(self.addr, self.identity.peer_id())
    }

    /// Wait for the first event matching `pred`, skipping others
    async fn expect(&mut self, pred: impl Fn(&OverlayEvent) -> bool) -> OverlayEvent {
        timeout(TEST_TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Assert no event matching `pred` arrives for a short while
    async fn expect_none(&mut self, pred: impl Fn(&OverlayEvent) -> bool) {
        let result = timeout(SHORT_TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await;
        assert!(result.is_err(), "unexpected event: {:?}", result);
    }
}

/// `N` nodes on 127.0.0.2.. that all trust each other
fn network<const N: usize>(port: u16) -> [TestNode; N] {
    let keys: Vec<KeyPair> = (0..N).map(|_| KeyPair::generate()).collect();
    let trust: TrustSet = keys.iter().map(KeyPair::peer_id).collect();
    std::array::from_fn(|i| TestNode::new(i as u8 + 2, port, keys[i].clone(), trust.clone()))
}

fn collector() -> (impl Fn(&str) + Send + Sync + 'static, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatch = move |text: &str| {
        let _ = tx.send(text.to_string());
    };
    (dispatch, rx)
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("dispatcher dropped")
}

#[tokio::test]
async fn connect_records_peers_and_delivers_messages() {
    let [mut a, mut b] = network::<2>(next_port());
    a.overlay.start_listening().expect("listen failed");

    let remote = timeout(TEST_TIMEOUT, b.overlay.connect(a.addr))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    assert_eq!(remote, a.peer());

    let b_peer = b.peer();
    b.expect(|e| *e == OverlayEvent::Connected(a.peer())).await;
    a.expect(|e| *e == OverlayEvent::PeerConnected(b_peer)).await;

    // Both ends know each other at the address they listen on
    assert_eq!(a.overlay.known_peers(), vec![b.peer()]);
    assert_eq!(b.overlay.known_peers(), vec![a.peer()]);
    assert_eq!(a.overlay.neighbours(), vec![b.peer()]);
    assert_eq!(b.overlay.neighbours(), vec![a.peer()]);

    let (dispatch, mut inbox_a) = collector();
    a.overlay.set_dispatcher(b.addr, dispatch).unwrap();
    b.overlay.send(a.addr, "hello").await.unwrap();
    assert_eq!(next_message(&mut inbox_a).await, "hello");

    // Replies reuse the accepted connection
    let (dispatch, mut inbox_b) = collector();
    b.overlay.set_dispatcher(a.addr, dispatch).unwrap();
    a.overlay.send(b.addr, "hi yourself").await.unwrap();
    assert_eq!(next_message(&mut inbox_b).await, "hi yourself");
    assert_eq!(a.overlay.connections(), vec![b.peer()]);
    assert_eq!(b.overlay.connections(), vec![a.peer()]);

    a.overlay.stop().await;
    b.overlay.stop().await;
}

#[tokio::test]
async fn requests_with_nothing_to_share_get_none() {
    let [a, b] = network::<2>(next_port());
    a.overlay.start_listening().unwrap();
    b.overlay.connect(a.addr).await.unwrap();

    // A's only neighbour and known peer is B itself
    timeout(TEST_TIMEOUT, b.overlay.request_neighbours(a.addr))
        .await
        .expect("neighbour request never released")
        .unwrap();
    assert_eq!(b.overlay.neighbours(), vec![a.peer()]);

    timeout(TEST_TIMEOUT, b.overlay.request_known_peers(a.addr))
        .await
        .expect("known peer request never released")
        .unwrap();
    assert_eq!(b.overlay.known_peers(), vec![a.peer()]);

    // The request lock was released, so a second round works
    timeout(TEST_TIMEOUT, b.overlay.request_neighbours(a.addr))
        .await
        .expect("second request never released")
        .unwrap();

    a.overlay.stop().await;
    b.overlay.stop().await;
}

#[tokio::test]
async fn untrusted_peers_are_rejected() {
    let port = next_port();
    let a_key = KeyPair::generate();
    let b_key = KeyPair::generate();
    let c_key = KeyPair::generate();

    // A trusts C but not B; B trusts A; C trusts nobody
    let a = TestNode::new(2, port, a_key.clone(), [c_key.peer_id()].into_iter().collect());
    let b = TestNode::new(3, port, b_key, [a_key.peer_id()].into_iter().collect());
    let c = TestNode::new(4, port, c_key, TrustSet::new());
    a.overlay.start_listening().unwrap();

    let result = timeout(TEST_TIMEOUT, b.overlay.connect(a.addr)).await.unwrap();
    assert!(matches!(result, Err(OverlayError::Channel(_))), "{:?}", result);

    let result = timeout(TEST_TIMEOUT, c.overlay.connect(a.addr)).await.unwrap();
    assert!(matches!(result, Err(OverlayError::Channel(_))), "{:?}", result);

    assert!(a.overlay.known_peers().is_empty());
    assert!(b.overlay.known_peers().is_empty());
    assert!(c.overlay.connections().is_empty());

    a.overlay.stop().await;
}

#[tokio::test]
async fn connect_to_absent_node_fails() {
    let [a] = network::<1>(next_port());
    let result = timeout(TEST_TIMEOUT, a.overlay.connect(loopback(250))).await.unwrap();
    assert!(matches!(result, Err(OverlayError::Io(_))), "{:?}", result);
    assert!(a.overlay.known_peers().is_empty());
}

#[tokio::test]
async fn new_peer_floods_along_a_chain() {
    let [mut a, mut b, mut c, d] = network::<4>(next_port());
    for node in [&a, &b, &c, &d] {
        node.overlay.start_listening().unwrap();
    }

    // A <- B <- C <- D
    b.overlay.connect(a.addr).await.unwrap();
    a.expect(|e| matches!(e, OverlayEvent::PeerConnected(_))).await;

    c.overlay.connect(b.addr).await.unwrap();
    let c_peer = c.peer();
    b.expect(|e| *e == OverlayEvent::PeerConnected(c_peer)).await;
    a.expect(|e| *e == OverlayEvent::PeerJoined(c_peer)).await;

    d.overlay.connect(c.addr).await.unwrap();
    let d_peer = d.peer();
    c.expect(|e| *e == OverlayEvent::PeerConnected(d_peer)).await;
    b.expect(|e| *e == OverlayEvent::PeerJoined(d_peer)).await;
    a.expect(|e| *e == OverlayEvent::PeerJoined(d_peer)).await;

    // Each node learns D exactly once
    a.expect_none(|e| *e == OverlayEvent::PeerJoined(d_peer)).await;
    b.expect_none(|e| *e == OverlayEvent::PeerJoined(d_peer)).await;

    let known_by_a = a.overlay.known_peers();
    assert!(known_by_a.contains(&b.peer()));
    assert!(known_by_a.contains(&c.peer()));
    assert!(known_by_a.contains(&d.peer()));
    assert_eq!(known_by_a.len(), 3);

    for node in [&a, &b, &c, &d] {
        node.overlay.stop().await;
    }
}

#[tokio::test]
async fn join_bootstraps_from_gossip_trust() {
    let port = next_port();
    let a_key = KeyPair::generate();
    let b_key = KeyPair::generate();
    let c_key = KeyPair::generate();

    // B and C only trust A up front; A trusts both
    let mut a = TestNode::new(
        2,
        port,
        a_key.clone(),
        [b_key.peer_id(), c_key.peer_id()].into_iter().collect(),
    );
    let mut b = TestNode::new(3, port, b_key, [a_key.peer_id()].into_iter().collect());
    let mut c = TestNode::new(4, port, c_key, [a_key.peer_id()].into_iter().collect());

    a.overlay.start_listening().unwrap();
    b.overlay.join(a.addr).await.unwrap();
    b.expect(|e| *e == OverlayEvent::Joined(a.addr)).await;
    let b_peer = b.peer();
    a.expect(|e| *e == OverlayEvent::PeerConnected(b_peer)).await;

    timeout(TEST_TIMEOUT, c.overlay.join(a.addr))
        .await
        .expect("join timed out")
        .expect("join failed");
    assert!(c.overlay.is_listening());

    let c_peer = c.peer();
    c.expect(|e| *e == OverlayEvent::Connected(a.peer())).await;
    c.expect(|e| *e == OverlayEvent::ReceivedPeers(a.addr)).await;
    c.expect(|e| *e == OverlayEvent::Joined(a.addr)).await;

    // C took A's neighbours and known peers; B heard about C from A
    assert_eq!(c.overlay.neighbours(), vec![a.peer(), b.peer()]);
    assert!(c.overlay.known_peers().contains(&b.peer()));
    b.expect(|e| *e == OverlayEvent::PeerJoined(c_peer)).await;

    // Keys learned through gossip are trusted for new handshakes
    c.overlay.connect(b.addr).await.unwrap();
    b.expect(|e| *e == OverlayEvent::PeerConnected(c_peer)).await;

    let (dispatch, mut inbox) = collector();
    b.overlay.set_dispatcher(c.addr, dispatch).unwrap();
    c.overlay.send(b.addr, "found you").await.unwrap();
    assert_eq!(next_message(&mut inbox).await, "found you");

    for node in [&a, &b, &c] {
        node.overlay.stop().await;
    }
}

#[tokio::test]
async fn disconnect_keeps_registries() {
    let [mut a, b] = network::<2>(next_port());
    a.overlay.start_listening().unwrap();
    b.overlay.connect(a.addr).await.unwrap();

    let b_peer = b.peer();
    a.expect(|e| *e == OverlayEvent::PeerConnected(b_peer)).await;

    b.overlay.stop().await;
    a.expect(|e| *e == OverlayEvent::PeerDisconnected(b_peer)).await;

    assert!(a.overlay.connections().is_empty());
    assert_eq!(a.overlay.known_peers(), vec![b.peer()]);
    assert_eq!(a.overlay.neighbours(), vec![b.peer()]);
    assert!(a.overlay.connection(b.addr).is_none());

    a.overlay.stop().await;
}

#[tokio::test]
async fn listening_twice_is_an_error() {
    let [a] = network::<1>(next_port());
    a.overlay.start_listening().unwrap();
    assert!(matches!(
        a.overlay.start_listening(),
        Err(OverlayError::AlreadyListening)
    ));
    a.overlay.stop().await;
}

#[tokio::test]
async fn simultaneous_connects_keep_one_channel() {
    let [mut a, mut b] = network::<2>(next_port());
    a.overlay.start_listening().unwrap();
    b.overlay.start_listening().unwrap();

    let (to_b, to_a) = timeout(
        TEST_TIMEOUT,
        async { tokio::join!(a.overlay.connect(b.addr), b.overlay.connect(a.addr)) },
    )
    .await
    .expect("connects timed out");
    assert_eq!(to_b.unwrap(), b.peer());
    assert_eq!(to_a.unwrap(), a.peer());

    tokio::time::sleep(SHORT_TIMEOUT).await;

    // Both ends settled on the same channel, seen from opposite roles
    let at_a = a.overlay.connection(b.addr).expect("A lost its channel");
    let at_b = b.overlay.connection(a.addr).expect("B lost its channel");
    assert!(at_a.is_alive());
    assert!(at_b.is_alive());
    assert_ne!(at_a.role(), at_b.role());
    assert_eq!(a.overlay.connections(), vec![b.peer()]);
    assert_eq!(b.overlay.connections(), vec![a.peer()]);

    a.expect_none(|e| matches!(e, OverlayEvent::PeerDisconnected(_))).await;
    b.expect_none(|e| matches!(e, OverlayEvent::PeerDisconnected(_))).await;

    let (dispatch, mut inbox_a) = collector();
    a.overlay.set_dispatcher(b.addr, dispatch).unwrap();
    let (dispatch, mut inbox_b) = collector();
    b.overlay.set_dispatcher(a.addr, dispatch).unwrap();

    b.overlay.send(a.addr, "ping").await.unwrap();
    assert_eq!(next_message(&mut inbox_a).await, "ping");
    a.overlay.send(b.addr, "pong").await.unwrap();
    assert_eq!(next_message(&mut inbox_b).await, "pong");

    a.overlay.stop().await;
    b.overlay.stop().await;
}

#[tokio::test]
async fn new_peer_floods_around_a_ring_once() {
    let [mut a, mut b, mut c, mut d, e] = network::<5>(next_port());
    for node in [&a, &b, &c, &d, &e] {
        node.overlay.start_listening().unwrap();
    }

    // Ring A - B - C - D - A
    b.overlay.connect(a.addr).await.unwrap();
    c.overlay.connect(b.addr).await.unwrap();
    d.overlay.connect(c.addr).await.unwrap();
    let (b_peer, c_peer, d_peer) = (b.peer(), c.peer(), d.peer());
    b.expect(|ev| *ev == OverlayEvent::PeerJoined(d_peer)).await;
    a.expect(|ev| *ev == OverlayEvent::PeerJoined(d_peer)).await;

    a.overlay.connect(d.addr).await.unwrap();
    let a_peer = a.peer();
    c.expect(|ev| *ev == OverlayEvent::PeerJoined(a_peer)).await;

    // Let the last announcements die out at nodes that already know them
    tokio::time::sleep(SHORT_TIMEOUT).await;
    for node in [&a, &b, &c, &d] {
        assert_eq!(node.overlay.neighbours().len(), 2);
    }
    assert!(a.overlay.neighbours().contains(&b_peer));
    assert!(c.overlay.neighbours().contains(&d_peer));
    assert!(d.overlay.neighbours().contains(&c_peer));

    // E joins at A; C hears about it from both B and D
    e.overlay.connect(a.addr).await.unwrap();
    let e_peer = e.peer();
    a.expect(|ev| *ev == OverlayEvent::PeerConnected(e_peer)).await;
    b.expect(|ev| *ev == OverlayEvent::PeerJoined(e_peer)).await;
    c.expect(|ev| *ev == OverlayEvent::PeerJoined(e_peer)).await;
    d.expect(|ev| *ev == OverlayEvent::PeerJoined(e_peer)).await;

    for node in [&mut a, &mut b, &mut c, &mut d] {
        node.expect_none(|ev| *ev == OverlayEvent::PeerJoined(e_peer)).await;
        assert!(node.overlay.known_peers().contains(&e_peer));
    }

    for node in [&a, &b, &c, &d, &e] {
        node.overlay.stop().await;
    }
}

#[tokio::test]
async fn messages_before_dispatcher_are_kept() {
    let [mut a, b] = network::<2>(next_port());
    a.overlay.start_listening().unwrap();
    b.overlay.connect(a.addr).await.unwrap();

    // Sent straight after the handshake, before A attaches a dispatcher
    b.overlay.send(a.addr, "early").await.unwrap();
    b.overlay.send(a.addr, "also early").await.unwrap();

    let b_peer = b.peer();
    a.expect(|ev| *ev == OverlayEvent::PeerConnected(b_peer)).await;
    tokio::time::sleep(SHORT_TIMEOUT).await;

    let (dispatch, mut inbox) = collector();
    a.overlay.set_dispatcher(b.addr, dispatch).unwrap();
    b.overlay.send(a.addr, "late").await.unwrap();

    assert_eq!(next_message(&mut inbox).await, "early");
    assert_eq!(next_message(&mut inbox).await, "also early");
    assert_eq!(next_message(&mut inbox).await, "late");

    a.overlay.stop().await;
    b.overlay.stop().await;
}

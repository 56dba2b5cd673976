//! End-to-end chat over localhost QUIC.
//!
//! Discovery is bypassed with `ChatSession::invite` so the tests run on
//! machines without multicast; the full mDNS round-trip is covered by an
//! ignored test for environments that allow it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use nearchat::{ChatEvent, ChatSession, EngineConfig};
use tokio::sync::broadcast;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nearchat=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn session(name: &str) -> ChatSession {
    let config = EngineConfig {
        display_name: Some(name.to_string()),
        ..Default::default()
    };
    ChatSession::new(config).expect("engine")
}

fn loopback(session: &ChatSession) -> SocketAddr {
    let port = session.local_addr().expect("local addr").port();
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<ChatEvent>, mut predicate: F) -> ChatEvent
where
    F: FnMut(&ChatEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn message_reaches_connected_peer() {
    init_logging();
    let alice = session("Alice");
    let bob = session("Bob");
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    alice.invite(bob.identity().clone(), loopback(&bob));

    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == bob.identity())
    })
    .await;
    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == alice.identity())
    })
    .await;

    assert_eq!(alice.connected_peer_count(), 1);
    assert_eq!(bob.connected_peer_count(), 1);

    alice.send("hello").expect("send");

    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::MessageReceived(_))
    })
    .await;

    let log = bob.messages();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].display_line(), "[Alice]: hello");
}

#[tokio::test]
async fn duplicate_invites_are_no_ops() {
    init_logging();
    let alice = session("Alice");
    let bob = session("Bob");
    let mut alice_events = alice.subscribe();
    let addr = loopback(&bob);

    alice.invite(bob.identity().clone(), addr);
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == bob.identity())
    })
    .await;

    // Re-discovery of the same peer re-invites; the peer set must not grow
    // and the link must stay usable.
    alice.invite(bob.identity().clone(), addr);
    alice.invite(bob.identity().clone(), addr);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(alice.connected_peer_count(), 1);
    alice.send("still here").expect("send after re-invite");
}

#[tokio::test]
async fn peer_stop_is_observed_as_disconnect() {
    init_logging();
    let alice = session("Alice");
    let bob = session("Bob");
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    alice.invite(bob.identity().clone(), loopback(&bob));
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == bob.identity())
    })
    .await;
    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == alice.identity())
    })
    .await;

    alice.stop();

    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::PeerDisconnected(p) if p == alice.identity())
    })
    .await;
    assert_eq!(bob.connected_peer_count(), 0);
}

#[tokio::test]
async fn simultaneous_invites_collapse_to_one_link() {
    init_logging();
    let alice = session("Alice");
    let bob = session("Bob");
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    // Both sides invite each other at once, as happens when both browsers
    // resolve the other's advertisement.
    alice.invite(bob.identity().clone(), loopback(&bob));
    bob.invite(alice.identity().clone(), loopback(&alice));

    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == bob.identity())
    })
    .await;
    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == alice.identity())
    })
    .await;

    // Let any duplicate link teardown settle, then check both directions.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.connected_peer_count(), 1);
    assert_eq!(bob.connected_peer_count(), 1);

    alice.send("ping").expect("send a->b");
    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::MessageReceived(m) if m.display_line() == "[Alice]: ping")
    })
    .await;

    bob.send("pong").expect("send b->a");
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::MessageReceived(m) if m.display_line() == "[Bob]: pong")
    })
    .await;
}

#[tokio::test]
async fn peers_can_reconnect_after_stop() {
    init_logging();
    let alice = session("Alice");
    let bob = session("Bob");
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    alice.invite(bob.identity().clone(), loopback(&bob));
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == bob.identity())
    })
    .await;
    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == alice.identity())
    })
    .await;

    alice.stop();
    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::PeerDisconnected(p) if p == alice.identity())
    })
    .await;
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::PeerDisconnected(p) if p == bob.identity())
    })
    .await;

    // The endpoint must survive stop(): the activation cycle is
    // repeatable, so a re-invite has to reach Alice on the same port.
    bob.invite(alice.identity().clone(), loopback(&alice));
    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == alice.identity())
    })
    .await;
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == bob.identity())
    })
    .await;

    bob.send("welcome back").expect("send after reconnect");
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::MessageReceived(m) if m.display_line() == "[Bob]: welcome back")
    })
    .await;
}

// Needs a multicast-capable network; run with `cargo test -- --ignored`.
#[tokio::test]
#[ignore]
async fn peers_discover_each_other_over_mdns() {
    init_logging();
    let config = |name: &str| EngineConfig {
        display_name: Some(name.to_string()),
        service_type: "_nctest._udp.local.".to_string(),
        ..Default::default()
    };
    let alice = ChatSession::new(config("Alice")).expect("engine");
    let bob = ChatSession::new(config("Bob")).expect("engine");
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    alice.start();
    bob.start();

    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == bob.identity())
    })
    .await;
    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::PeerConnected(p) if p == alice.identity())
    })
    .await;

    alice.send("hello").expect("send");
    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::MessageReceived(m) if m.display_line() == "[Alice]: hello")
    })
    .await;

    alice.stop();
    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::PeerDisconnected(p) if p == alice.identity())
    })
    .await;
    bob.stop();
}

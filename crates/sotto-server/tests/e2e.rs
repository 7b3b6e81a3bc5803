//! End-to-end scenario: two real clients exchanging encrypted messages
//! through a relay that only ever sees opaque envelopes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use sotto_client::{ChatClient, ChatEvent, CipherSession};
use sotto_server::{ChatServer, ServerConfig};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE: Duration = Duration::from_millis(300);

async fn start_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = ChatServer::new(ServerConfig::default());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

async fn next_event(rx: &mut mpsc::Receiver<ChatEvent>) -> ChatEvent {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

async fn assert_no_event(rx: &mut mpsc::Receiver<ChatEvent>) {
    let got = timeout(SILENCE, rx.recv()).await;
    assert!(got.is_err(), "expected no event, got {got:?}");
}

#[tokio::test]
async fn ana_and_bob_exchange_encrypted_messages() {
    let addr = start_relay().await;
    let url = format!("ws://{addr}/ws");

    let ana_session = Arc::new(CipherSession::new("Ana"));
    let (ana, mut ana_events) = ChatClient::connect(&url, ana_session.clone())
        .await
        .expect("ana connects");
    assert_eq!(
        next_event(&mut ana_events).await,
        ChatEvent::Roster { users: vec![] }
    );

    let bob_session = Arc::new(CipherSession::new("Bob"));
    let (bob, mut bob_events) = ChatClient::connect(&url, bob_session.clone())
        .await
        .expect("bob connects");
    assert_eq!(
        next_event(&mut bob_events).await,
        ChatEvent::Roster {
            users: vec!["Ana".into()]
        }
    );

    // Ana learns Bob's key from the join broadcast.
    match next_event(&mut ana_events).await {
        ChatEvent::PeerJoined { username, users } => {
            assert_eq!(username, "Bob");
            assert_eq!(users, vec!["Ana".to_string(), "Bob".to_string()]);
        }
        other => panic!("expected PeerJoined, got {other:?}"),
    }
    assert!(ana_session.knows("Bob").await);
    assert!(bob_session.knows("Ana").await);

    // A private message to Bob: Bob reads the plaintext, Ana's own socket
    // stays quiet.
    ana.send_chat_to("ciao Bob", vec!["Bob".into()])
        .await
        .expect("send");
    match next_event(&mut bob_events).await {
        ChatEvent::Message {
            username,
            text,
            own,
            message_id,
            ..
        } => {
            assert_eq!(username, "Ana");
            assert_eq!(text, "ciao Bob");
            assert!(!own);
            assert!(!message_id.is_empty());
        }
        other => panic!("expected Message, got {other:?}"),
    }
    assert_no_event(&mut ana_events).await;

    // A broadcast back: Ana decrypts it through her own-username slot.
    bob.send_chat("ciao Ana").await.expect("send");
    match next_event(&mut ana_events).await {
        ChatEvent::Message { username, text, .. } => {
            assert_eq!(username, "Bob");
            assert_eq!(text, "ciao Ana");
        }
        other => panic!("expected Message, got {other:?}"),
    }
}

#[tokio::test]
async fn departures_surface_with_refreshed_rosters() {
    let addr = start_relay().await;
    let url = format!("ws://{addr}/ws");

    let ana_session = Arc::new(CipherSession::new("Ana"));
    let (_ana, mut ana_events) = ChatClient::connect(&url, ana_session)
        .await
        .expect("ana connects");
    next_event(&mut ana_events).await;

    let bob_session = Arc::new(CipherSession::new("Bob"));
    let (bob, mut bob_events) = ChatClient::connect(&url, bob_session)
        .await
        .expect("bob connects");
    next_event(&mut bob_events).await;
    next_event(&mut ana_events).await; // Bob's join

    bob.close();
    match next_event(&mut ana_events).await {
        ChatEvent::PeerLeft { username, users } => {
            assert_eq!(username, "Bob");
            assert_eq!(users, vec!["Ana".to_string()]);
        }
        other => panic!("expected PeerLeft, got {other:?}"),
    }
}

#[tokio::test]
async fn typing_signals_flow_between_clients() {
    let addr = start_relay().await;
    let url = format!("ws://{addr}/ws");

    let (_ana, mut ana_events) =
        ChatClient::connect(&url, Arc::new(CipherSession::new("Ana")))
            .await
            .expect("ana connects");
    next_event(&mut ana_events).await;

    let (bob, mut bob_events) =
        ChatClient::connect(&url, Arc::new(CipherSession::new("Bob")))
            .await
            .expect("bob connects");
    next_event(&mut bob_events).await;
    next_event(&mut ana_events).await;

    bob.set_typing(true).await.expect("typing");
    assert_eq!(
        next_event(&mut ana_events).await,
        ChatEvent::Typing {
            username: "Bob".into()
        }
    );

    bob.set_typing(false).await.expect("stop typing");
    assert_eq!(
        next_event(&mut ana_events).await,
        ChatEvent::StopTyping {
            username: "Bob".into()
        }
    );
}

#[tokio::test]
async fn app_level_ping_round_trips() {
    let addr = start_relay().await;
    let url = format!("ws://{addr}/ws");

    let (ana, mut ana_events) =
        ChatClient::connect(&url, Arc::new(CipherSession::new("Ana")))
            .await
            .expect("ana connects");
    next_event(&mut ana_events).await;

    ana.ping().await.expect("ping");
    match next_event(&mut ana_events).await {
        ChatEvent::Pong { timestamp } => assert!(!timestamp.is_empty()),
        other => panic!("expected Pong, got {other:?}"),
    }
}

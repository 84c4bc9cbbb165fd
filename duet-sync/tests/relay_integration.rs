//! Integration tests for the pairing relay.
//!
//! These tests start a real relay and connect raw WebSocket clients,
//! verifying admission, forwarding and rejection end to end.

use duet_sync::pair::SessionState;
use duet_sync::relay::{RelayServer, RelayStats};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a relay on a free port, return it with its URL.
async fn start_relay() -> (RelayServer, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = RelayServer::with_defaults();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, url)
}

async fn wait_for_state(server: &RelayServer, expected: SessionState) {
    timeout(Duration::from_secs(2), async {
        while server.session_state().await != expected {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Relay never reached {expected:?}"));
}

/// Counters are bumped after delivery, so poll rather than read once.
async fn wait_for_stats(server: &RelayServer, done: impl Fn(&RelayStats) -> bool) -> RelayStats {
    timeout(Duration::from_secs(2), async {
        loop {
            let stats = server.stats();
            if done(&stats) {
                return stats;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Stats never settled: {:?}", server.stats()))
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Connect two clients and wait until the relay has paired them.
async fn connect_pair(server: &RelayServer, url: &str) -> (Ws, Ws) {
    let a = connect(url).await;
    wait_for_state(server, SessionState::WaitingForPeer).await;
    let b = connect(url).await;
    wait_for_state(server, SessionState::Paired).await;
    (a, b)
}

async fn send_text(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Next text frame, skipping control frames.
async fn next_text(ws: &mut Ws) -> String {
    timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_owned(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("Expected text frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("Timed out waiting for a frame")
}

async fn assert_silent(ws: &mut Ws) {
    let result = timeout(Duration::from_millis(150), ws.next()).await;
    assert!(result.is_err(), "Expected no frame, got {result:?}");
}

#[tokio::test]
async fn test_forwards_verbatim_both_ways() {
    let (server, url) = start_relay().await;
    let (mut a, mut b) = connect_pair(&server, &url).await;

    let from_a = r#"{"user":"A","batch_id":0,"changes":[],"extra":{"kept":true}}"#;
    send_text(&mut a, from_a).await;
    assert_eq!(next_text(&mut b).await, from_a);

    send_text(&mut b, "not even json").await;
    assert_eq!(next_text(&mut a).await, "not even json");

    let stats = wait_for_stats(&server, |s| s.forwarded_messages == 2).await;
    assert_eq!(stats.forwarded_bytes, (from_a.len() + "not even json".len()) as u64);
}

#[tokio::test]
async fn test_sender_gets_no_echo() {
    let (server, url) = start_relay().await;
    let (mut a, mut b) = connect_pair(&server, &url).await;

    send_text(&mut a, "hello").await;
    assert_eq!(next_text(&mut b).await, "hello");
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_third_client_rejected_with_policy_close() {
    let (server, url) = start_relay().await;
    let (mut a, mut b) = connect_pair(&server, &url).await;

    let mut c = connect(&url).await;
    let frame = timeout(Duration::from_secs(2), c.next())
        .await
        .expect("Timed out waiting for close");
    match frame {
        Some(Ok(Message::Close(Some(close)))) => {
            assert_eq!(close.code, CloseCode::Policy);
            assert_eq!(close.reason.as_str(), "Maximum clients reached");
        }
        other => panic!("Expected policy close, got {other:?}"),
    }

    // The existing pair keeps exchanging.
    send_text(&mut a, "still here").await;
    assert_eq!(next_text(&mut b).await, "still here");
    send_text(&mut b, "me too").await;
    assert_eq!(next_text(&mut a).await, "me too");

    assert_eq!(server.session_state().await, SessionState::Paired);
    let stats = wait_for_stats(&server, |s| s.rejected_connections == 1).await;
    assert_eq!(stats.total_connections, 3);
}

#[tokio::test]
async fn test_messages_dropped_while_waiting_for_peer() {
    let (server, url) = start_relay().await;
    let mut a = connect(&url).await;
    wait_for_state(&server, SessionState::WaitingForPeer).await;

    send_text(&mut a, "into the void").await;
    wait_for_stats(&server, |s| s.dropped_messages == 1).await;

    let mut b = connect(&url).await;
    wait_for_state(&server, SessionState::Paired).await;

    send_text(&mut a, "after pairing").await;
    assert_eq!(next_text(&mut b).await, "after pairing");
}

#[tokio::test]
async fn test_freed_slot_accepts_new_client() {
    let (server, url) = start_relay().await;
    let (mut a, mut b) = connect_pair(&server, &url).await;

    a.close(None).await.unwrap();
    wait_for_state(&server, SessionState::WaitingForPeer).await;

    // The remaining peer is not told about the departure.
    assert_silent(&mut b).await;

    let mut c = connect(&url).await;
    wait_for_state(&server, SessionState::Paired).await;

    send_text(&mut c, "new peer").await;
    assert_eq!(next_text(&mut b).await, "new peer");
    send_text(&mut b, "welcome").await;
    assert_eq!(next_text(&mut c).await, "welcome");
}

#[tokio::test]
async fn test_burst_preserves_order() {
    let (server, url) = start_relay().await;
    let (mut a, mut b) = connect_pair(&server, &url).await;

    for i in 0..100 {
        send_text(&mut a, &format!("msg-{i}")).await;
    }
    for i in 0..100 {
        assert_eq!(next_text(&mut b).await, format!("msg-{i}"));
    }
}

#[tokio::test]
async fn test_ping_answered() {
    let (server, url) = start_relay().await;
    let (mut a, _b) = connect_pair(&server, &url).await;

    a.send(Message::Ping(b"tick".to_vec().into())).await.unwrap();
    let reply = timeout(Duration::from_secs(2), a.next()).await.unwrap();
    assert!(
        matches!(reply, Some(Ok(Message::Pong(ref data))) if &data[..] == b"tick"),
        "Expected pong, got {reply:?}"
    );
}

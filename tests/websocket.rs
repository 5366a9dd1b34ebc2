#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use mesh_room::relay::{serve, Relay};
use mesh_room::signaling::WebSocketConnector;
use mesh_room::{Config, RoomSession, SessionEvent};

use common::{collaborators, connected_to, next_event};

async fn start_relay() -> (Arc<Relay>, String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let relay = Arc::new(Relay::new());
    let shutdown = CancellationToken::new();
    tokio::spawn(serve(Arc::clone(&relay), listener, shutdown.clone()));
    (relay, url, shutdown)
}

async fn next_json(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> Value {
    loop {
        if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

fn config(url: &str) -> Config {
    Config {
        relay_url: url.to_string(),
        ..Config::default()
    }
}

#[tokio::test]
async fn test_sessions_connect_through_websocket_relay() {
    let (relay, url, shutdown) = start_relay().await;
    let config = config(&url);
    let connector = || Arc::new(WebSocketConnector::new(config.connect_timeout()));

    let (a, mut a_events) = RoomSession::join("abc123", &config, collaborators(connector()))
        .await
        .unwrap();
    let (b, _b_events) = RoomSession::join("abc123", &config, collaborators(connector()))
        .await
        .unwrap();

    connected_to(&a, 1).await;
    connected_to(&b, 1).await;
    assert_eq!(relay.room_members("abc123").len(), 2);

    b.leave().await;
    next_event(&mut a_events, |e| matches!(e, SessionEvent::PeerRemoved { .. })).await;
    assert!(a.peers().is_empty());

    a.leave().await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_relay_shutdown_reports_signaling_lost() {
    let (_relay, url, shutdown) = start_relay().await;
    let config = config(&url);
    let (a, mut a_events) = RoomSession::join(
        "r",
        &config,
        collaborators(Arc::new(WebSocketConnector::new(config.connect_timeout()))),
    )
    .await
    .unwrap();

    shutdown.cancel();

    next_event(&mut a_events, |e| matches!(e, SessionEvent::SignalingLost)).await;
    a.leave().await;
}

#[tokio::test]
async fn test_relay_speaks_event_data_frames() {
    let (_relay, url, shutdown) = start_relay().await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["event"], "welcome");
    assert!(welcome["data"]["id"].is_string());

    ws.send(Message::Text(json!({"event": "join-room", "data": "abc123"}).to_string()))
        .await
        .unwrap();
    assert_eq!(
        next_json(&mut ws).await,
        json!({"event": "all-users", "data": []})
    );

    shutdown.cancel();
}

//! Test utilities and common setup.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use futures::StreamExt;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

use lunchtrip::api::{self, AppState};
use lunchtrip::auth::{AuthConfig, AuthState, UserAccount};
use lunchtrip::config::HubConfig;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const ALICE_PASSWORD: &str = "alice-lunch-password";
pub const BOB_PASSWORD: &str = "bob-lunch-password";

fn account(id: &str, name: &str, password: &str) -> UserAccount {
    UserAccount {
        id: id.to_string(),
        name: name.to_string(),
        // Minimum cost keeps the suite fast
        password_hash: bcrypt::hash(password, 4).unwrap(),
    }
}

/// Create a test AuthConfig with a JWT secret and two users.
fn test_auth_config() -> AuthConfig {
    AuthConfig {
        jwt_secret: Some("test-secret-for-integration-tests-minimum-32-chars".to_string()),
        users: vec![
            account("alice", "Alice", ALICE_PASSWORD),
            account("bob", "Bob", BOB_PASSWORD),
        ],
        ..AuthConfig::default()
    }
}

/// Create application state with a fresh hub.
pub fn test_state() -> AppState {
    let auth_state = AuthState::new(test_auth_config()).unwrap();
    AppState::new(auth_state, &HubConfig::default())
}

/// Create application state with custom hub settings and token lifetime.
pub fn test_state_with(hub: HubConfig, token_ttl_secs: i64) -> AppState {
    let auth_state = AuthState::new(AuthConfig {
        token_ttl_secs,
        ..test_auth_config()
    })
    .unwrap();
    AppState::new(auth_state, &hub)
}

/// Create a test application router.
pub fn test_app() -> Router {
    api::create_router(test_state())
}

/// Sign a token for a configured user.
pub fn token_for(state: &AppState, user_id: &str) -> String {
    state.auth.issue_token(user_id, user_id).unwrap().token
}

/// Start the server on a random port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let app = api::create_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Open a location stream authenticated via the `token` query parameter.
pub async fn connect(addr: SocketAddr, token: &str) -> WsClient {
    let url = format!("ws://{addr}/locations?token={token}");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Wait for the next data frame and parse it as JSON, skipping control frames.
pub async fn next_event(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("receive error");

        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Build an inbound location frame.
pub fn location_frame(latitude: f64, longitude: f64, timestamp_ms: i64) -> Message {
    Message::Text(
        serde_json::json!({
            "latitude": latitude,
            "longitude": longitude,
            "timestamp": timestamp_ms,
        })
        .to_string()
        .into(),
    )
}

/// Build an inbound focus report.
pub fn activity_frame(active: bool) -> Message {
    Message::Text(
        serde_json::json!({ "type": "background", "active": active })
            .to_string()
            .into(),
    )
}

/// Wait for the server's close frame, skipping any data still in flight, and
/// return its code.
pub async fn next_close_code(ws: &mut WsClient) -> u16 {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a close frame")
            .expect("stream ended without a close frame")
            .expect("receive error");

        match msg {
            Message::Close(Some(frame)) => return u16::from(frame.code),
            Message::Close(None) => panic!("close frame without a code"),
            _ => continue,
        }
    }
}

/// Assert that no data frame arrives within a short window.
pub async fn assert_quiet(ws: &mut WsClient) {
    let result = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(result.is_err(), "expected no frame, got {result:?}");
}

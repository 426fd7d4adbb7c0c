//! Shared harness: boots the agent router on an ephemeral port and provides
//! REST and WebSocket client helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use vmsan_agent::shell::manager::ShellConfig;
use vmsan_agent::shell::protocol::{encode_data, encode_resize, TAG_DATA, TAG_READY};
use vmsan_agent::{router, AppState};

pub const TOKEN: &str = "test-token";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn spawn_agent() -> SocketAddr {
    spawn_agent_with(ShellConfig::default()).await
}

pub async fn spawn_agent_with(config: ShellConfig) -> SocketAddr {
    let state = AppState::new(TOKEN, config);
    let app = router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve agent");
    });
    addr
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

/// Open a new shell session and return the socket plus the session id from
/// the metadata text frame.
pub async fn connect_shell(addr: SocketAddr, shell: &str) -> (WsClient, String) {
    let url = format!("ws://{addr}/ws/shell?token={TOKEN}&shell={shell}");
    let (mut ws, _) = connect_async(&url).await.expect("connect shell websocket");

    let message = recv_timeout(&mut ws, Duration::from_secs(5))
        .await
        .expect("session metadata frame");
    let Message::Text(text) = message else {
        panic!("expected text metadata frame, got {message:?}");
    };
    let value: serde_json::Value = serde_json::from_str(&text).expect("metadata json");
    let session_id = value["sessionId"]
        .as_str()
        .expect("sessionId field")
        .to_string();

    (ws, session_id)
}

pub async fn attach_shell(addr: SocketAddr, session_id: &str) -> WsClient {
    let url = format!("ws://{addr}/ws/shell/{session_id}?token={TOKEN}");
    let (ws, _) = connect_async(&url).await.expect("attach shell websocket");
    ws
}

pub async fn send_ready(ws: &mut WsClient) {
    ws.send(Message::Binary(vec![TAG_READY]))
        .await
        .expect("send ready frame");
}

pub async fn send_input(ws: &mut WsClient, input: &str) {
    ws.send(Message::Binary(encode_data(input.as_bytes())))
        .await
        .expect("send data frame");
}

pub async fn send_resize(ws: &mut WsClient, cols: u16, rows: u16) {
    ws.send(Message::Binary(encode_resize(cols, rows)))
        .await
        .expect("send resize frame");
}

pub async fn recv_timeout(ws: &mut WsClient, timeout: Duration) -> Option<Message> {
    match tokio::time::timeout(timeout, ws.next()).await {
        Ok(Some(Ok(message))) => Some(message),
        _ => None,
    }
}

/// Accumulate data-frame payloads until `pattern` shows up or the deadline
/// passes; returns everything collected either way.
pub async fn await_output(ws: &mut WsClient, pattern: &str, timeout: Duration) -> String {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut collected: Vec<u8> = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Binary(frame)))) => {
                if frame.first() == Some(&TAG_DATA) {
                    collected.extend_from_slice(&frame[1..]);
                }
                if String::from_utf8_lossy(&collected).contains(pattern) {
                    break;
                }
            }
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

/// Wait for a close frame, skipping any pending data frames.
pub async fn await_close(ws: &mut WsClient, timeout: Duration) -> Option<(u16, String)> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Close(frame)))) => {
                return frame.map(|f| (u16::from(f.code), f.reason.into_owned()));
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => return None,
            Err(_) => return None,
        }
    }
}

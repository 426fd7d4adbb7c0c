//! HTTP and WebSocket surface for the shell subsystem.
//!
//! WebSocket routes authenticate via `?token=` because browsers cannot set
//! headers on an upgrade; the REST routes sit behind the Bearer middleware.
//! Both checks are constant-time.

use std::borrow::Cow;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::session::{Session, MAX_WS_READ};
use super::ShellError;
use crate::{auth, json_error, pathutil, AppState};

/// Shells a controller may request, keyed by their cleaned absolute path.
const ALLOWED_SHELLS: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/ash",
    "/bin/zsh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
];

const DEFAULT_SHELL: &str = "/bin/bash";

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: String,
    shell: Option<String>,
}

/// `GET /ws/shell`: create a session and attach as its first subscriber.
pub async fn ws_new_session(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if !auth::token_eq(query.token.as_bytes(), &state.token) {
        return json_error(StatusCode::FORBIDDEN, "invalid token");
    }

    let requested = query.shell.as_deref().unwrap_or(DEFAULT_SHELL);
    let cleaned = pathutil::clean(FsPath::new(requested));
    let shell = match cleaned.to_str() {
        Some(shell) if ALLOWED_SHELLS.contains(&shell) => shell.to_string(),
        _ => return json_error(StatusCode::BAD_REQUEST, "shell not allowed"),
    };

    let session = match state.manager.create(&shell) {
        Ok(session) => session,
        Err(ShellError::SessionCapacity) => {
            return json_error(StatusCode::TOO_MANY_REQUESTS, "too many concurrent sessions");
        }
        Err(err) => {
            error!(error = %err, shell = %shell, "session create failed");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let Some(ws) = ws else {
        session.destroy().await;
        return json_error(StatusCode::BAD_REQUEST, "websocket upgrade required");
    };

    ws.max_message_size(MAX_WS_READ)
        .on_upgrade(move |socket| serve_subscriber(socket, session, true))
}

/// `GET /ws/shell/{sessionId}`: attach to an existing session.
pub async fn ws_attach(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if !auth::token_eq(query.token.as_bytes(), &state.token) {
        return json_error(StatusCode::FORBIDDEN, "invalid token");
    }

    let Some(session) = state.manager.get(&session_id) else {
        return json_error(StatusCode::NOT_FOUND, "session not found");
    };

    let Some(ws) = ws else {
        return json_error(StatusCode::BAD_REQUEST, "websocket upgrade required");
    };

    ws.max_message_size(MAX_WS_READ)
        .on_upgrade(move |socket| serve_subscriber(socket, session, false))
}

/// Bridge an upgraded socket to a session subscriber and hold the HTTP
/// transaction open until the subscriber is removed.
async fn serve_subscriber(mut socket: WebSocket, session: Arc<Session>, announce: bool) {
    if announce {
        // The creating client learns its session id from one text frame
        // sent before any binary frame.
        let metadata = json!({ "sessionId": session.id }).to_string();
        let _ = socket.send(Message::Text(metadata)).await;
    }

    match session.add_subscriber(socket) {
        Ok((subscriber_id, done)) => {
            info!(session_id = %session.id, subscriber_id = %subscriber_id, "subscriber connected");
            let _ = done.await;
            info!(session_id = %session.id, subscriber_id = %subscriber_id, "subscriber disconnected");
        }
        Err((mut socket, err)) => {
            warn!(session_id = %session.id, error = %err, "subscriber rejected");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: Cow::Owned(err.to_string()),
                })))
                .await;
        }
    }
}

/// `GET /shell/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Response {
    Json(state.manager.list()).into_response()
}

/// `POST /shell/sessions/{sessionId}/kill`
pub async fn kill_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.manager.kill(&session_id).await {
        Ok(()) => {
            info!(session_id = %session_id, "session killed");
            Json(json!({ "ok": true })).into_response()
        }
        Err(_) => json_error(StatusCode::NOT_FOUND, "session not found"),
    }
}

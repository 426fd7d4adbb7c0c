//! Remote-execution agent: authenticated HTTP+WebSocket API exposing
//! one-shot command execution, interactive PTY shell sessions, and file
//! transfer for a single host.

pub mod auth;
pub mod exec;
pub mod files;
pub mod pathutil;
pub mod shell;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::exec::CommandStore;
use crate::shell::manager::{SessionManager, ShellConfig};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub token: Arc<Vec<u8>>,
    pub manager: SessionManager,
    pub commands: CommandStore,
}

impl AppState {
    pub fn new(token: impl Into<Vec<u8>>, config: ShellConfig) -> Self {
        Self {
            token: Arc::new(token.into()),
            manager: SessionManager::new(config),
            commands: CommandStore::default(),
        }
    }
}

/// Assemble the full route table. The health endpoint is open; the
/// WebSocket routes authenticate via query token inside their handlers;
/// everything else sits behind Bearer auth with audit logging inside it.
pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/exec", post(exec::run))
        .route("/exec/:id/kill", post(exec::kill_command))
        .route(
            "/files/write",
            post(files::write_files).layer(DefaultBodyLimit::max(files::MAX_TAR_UPLOAD)),
        )
        .route("/files/read", post(files::read_file))
        .route("/shell/sessions", get(shell::handler::list_sessions))
        .route(
            "/shell/sessions/:session_id/kill",
            post(shell::handler::kill_session),
        )
        .layer(middleware::from_fn(auth::audit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/ws/shell", get(shell::handler::ws_new_session))
        .route("/ws/shell/:session_id", get(shell::handler::ws_attach))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": VERSION }))
}

pub(crate) fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

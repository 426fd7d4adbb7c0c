//! One-shot command execution with NDJSON streamed output.
//!
//! Each `/exec` request spawns the command with piped stdio and streams
//! `started`, `stdout`/`stderr`, and a terminal `exit`/`timeout`/`error`
//! event as newline-delimited JSON. Running commands register in a
//! process-wide store so `/exec/{id}/kill` can reach them.

use std::collections::HashMap;
use std::convert::Infallible;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use crate::shell::new_id;
use crate::{json_error, AppState};

const MAX_CONCURRENT_COMMANDS: usize = 16;
const EVENT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    detached: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecEvent {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ExecEvent {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            data: None,
            id: None,
            pid: None,
            exit_code: None,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            error: None,
        }
    }
}

type EventSender = mpsc::Sender<Result<String, Infallible>>;

async fn emit(tx: &EventSender, event: ExecEvent) {
    if let Ok(mut line) = serde_json::to_string(&event) {
        line.push('\n');
        let _ = tx.send(Ok(line)).await;
    }
}

/// Registry of running one-shot commands: command id to process id.
#[derive(Clone, Default)]
pub struct CommandStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    commands: RwLock<HashMap<String, u32>>,
    active: AtomicUsize,
}

impl CommandStore {
    fn try_acquire(&self) -> bool {
        if self.inner.active.load(Ordering::SeqCst) >= MAX_CONCURRENT_COMMANDS {
            return false;
        }
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn release(&self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn insert(&self, pid: u32) -> String {
        let id = new_id();
        self.inner.commands.write().insert(id.clone(), pid);
        id
    }

    fn get(&self, id: &str) -> Option<u32> {
        self.inner.commands.read().get(id).copied()
    }

    fn remove(&self, id: &str) {
        self.inner.commands.write().remove(id);
    }
}

fn kill_pid(pid: u32) -> nix::Result<()> {
    // pid 0 would signal the whole process group.
    if pid == 0 {
        return Err(nix::errno::Errno::ESRCH);
    }
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
}

/// `POST /exec`
pub async fn run(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = payload else {
        return json_error(StatusCode::BAD_REQUEST, "invalid request body");
    };
    if request.cmd.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "cmd is required");
    }

    info!(
        cmd = %request.cmd,
        args = ?request.args,
        cwd = ?request.cwd,
        detached = request.detached,
        timeout_ms = ?request.timeout_ms,
        "exec"
    );

    let store = state.commands.clone();
    if !store.try_acquire() {
        return json_error(StatusCode::TOO_MANY_REQUESTS, "too many concurrent commands");
    }

    let mut command = Command::new(&request.cmd);
    command
        .args(&request.args)
        .envs(&request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            store.release();
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("start: {err}"));
        }
    };

    let pid = child.id().unwrap_or_default();
    let cmd_id = store.insert(pid);
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);

    tokio::spawn(stream_command(store, child, cmd_id, pid, request, tx));

    let body = Body::from_stream(ReceiverStream::new(rx));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header("x-content-type-options", "nosniff")
        .body(body)
        .unwrap_or_else(|err| {
            error!(error = %err, "exec response build failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

async fn stream_command(
    store: CommandStore,
    mut child: tokio::process::Child,
    cmd_id: String,
    pid: u32,
    request: RunRequest,
    tx: EventSender,
) {
    let start = Instant::now();

    let mut started = ExecEvent::new("started");
    started.id = Some(cmd_id.clone());
    started.pid = Some(pid);
    emit(&tx, started).await;

    // Detached commands keep running past the response; a background reaper
    // clears the store entry when they exit.
    if request.detached {
        tokio::spawn(async move {
            let _ = child.wait().await;
            store.release();
            store.remove(&cmd_id);
            info!(
                cmd_id = %cmd_id,
                duration_ms = start.elapsed().as_millis() as u64,
                detached = true,
                "exec done"
            );
        });
        return;
    }

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let mut event = ExecEvent::new("error");
        event.error = Some("stdio pipes unavailable".to_string());
        emit(&tx, event).await;
        store.release();
        store.remove(&cmd_id);
        return;
    };

    let stdout_task = tokio::spawn(stream_lines(stdout, "stdout", tx.clone()));
    let stderr_task = tokio::spawn(stream_lines(stderr, "stderr", tx.clone()));

    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog = request.timeout_ms.filter(|ms| *ms > 0).map(|ms| {
        let timed_out = Arc::clone(&timed_out);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            timed_out.store(true, Ordering::SeqCst);
            let _ = kill_pid(pid);
        })
    });

    let _ = stdout_task.await;
    let _ = stderr_task.await;
    let status = child.wait().await;

    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    store.release();
    store.remove(&cmd_id);

    let duration_ms = start.elapsed().as_millis() as u64;
    if timed_out.load(Ordering::SeqCst) {
        info!(cmd_id = %cmd_id, duration_ms, timeout = true, "exec done");
        emit(&tx, ExecEvent::new("timeout")).await;
        return;
    }

    match status {
        Ok(status) => {
            let code = status.code().unwrap_or(-1);
            info!(cmd_id = %cmd_id, exit_code = code, duration_ms, "exec done");
            let mut event = ExecEvent::new("exit");
            event.exit_code = Some(code);
            emit(&tx, event).await;
        }
        Err(err) => {
            error!(cmd_id = %cmd_id, error = %err, duration_ms, "exec failed");
            let mut event = ExecEvent::new("error");
            event.error = Some(err.to_string());
            emit(&tx, event).await;
        }
    }
}

async fn stream_lines<R>(pipe: R, kind: &'static str, tx: EventSender)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut event = ExecEvent::new(kind);
        event.data = Some(line);
        emit(&tx, event).await;
    }
}

/// `POST /exec/{id}/kill`
pub async fn kill_command(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if id.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "id is required");
    }

    let Some(pid) = state.commands.get(&id) else {
        return json_error(StatusCode::NOT_FOUND, "command not found");
    };

    match kill_pid(pid) {
        Ok(()) => {
            info!(cmd_id = %id, pid, "command killed");
            Json(json!({ "status": "killed" })).into_response()
        }
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("kill: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::manager::ShellConfig;

    fn test_state() -> AppState {
        AppState::new("test-token", ShellConfig::default())
    }

    #[tokio::test]
    async fn kill_rejects_empty_id() {
        let response = kill_command(State(test_state()), Path(String::new())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn kill_unknown_id_is_not_found() {
        let response = kill_command(State(test_state()), Path("a".repeat(32))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

//! One PTY-backed shell process fanned out to its WebSocket subscribers.
//!
//! The session owns the PTY, the child, a producer task, a wait task, an
//! inactivity timer, the pre-ready buffer, and the subscriber registry.
//! Every teardown path (child exit, inactivity, explicit kill, handler
//! error) funnels into the one-shot `destroy`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::buffer::PendingOutput;
use super::protocol::{self, Frame};
use super::pty::{PtyHandle, PtyReader, PtyWriter};
use super::writer::WsWriter;
use super::{new_id, ShellError};

/// Frames queued per subscriber before overflow starts dropping.
const SUBSCRIBER_QUEUE_DEPTH: usize = 100;
/// Largest accepted incoming WebSocket message.
pub const MAX_WS_READ: usize = 64 * 1024;
/// Time allowed for flushing a close frame to each subscriber during destroy.
const CLOSE_DEADLINE: Duration = Duration::from_millis(200);

/// Manager callback invoked exactly once when a session is destroyed.
pub type DestroyHook = Box<dyn Fn(&str) + Send + Sync>;

/// Snapshot of a session for the REST listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub shell: String,
    pub created_at: DateTime<Utc>,
    pub subscriber_count: usize,
}

struct Subscriber {
    writer: Arc<WsWriter>,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    done: Option<oneshot::Sender<()>>,
}

pub struct Session {
    pub id: String,
    pub shell: String,
    pub created_at: DateTime<Utc>,

    pty: PtyHandle,
    pty_writer: PtyWriter,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    buffer: PendingOutput,
    cancel: CancellationToken,
    inactivity: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    on_destroy: DestroyHook,

    max_subscribers: usize,
    inactivity_timeout: Duration,
}

impl Session {
    /// Spawn the shell on a fresh PTY, start the producer and wait tasks,
    /// and arm the inactivity timer.
    pub fn spawn(
        id: String,
        shell: String,
        max_subscribers: usize,
        inactivity_timeout: Duration,
        on_destroy: DestroyHook,
    ) -> Result<Arc<Self>, ShellError> {
        let (pty, reader, pty_writer, mut child) =
            PtyHandle::spawn(&shell).map_err(ShellError::PtyStart)?;

        let session = Arc::new(Self {
            id,
            shell,
            created_at: Utc::now(),
            pty,
            pty_writer,
            subscribers: RwLock::new(HashMap::new()),
            buffer: PendingOutput::new(),
            cancel: CancellationToken::new(),
            inactivity: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            on_destroy,
            max_subscribers,
            inactivity_timeout,
        });

        session.arm_inactivity_timer();
        tokio::spawn(Arc::clone(&session).producer_loop(reader));
        tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                let _ = tokio::task::spawn_blocking(move || child.wait()).await;
                session.destroy().await;
            }
        });

        Ok(session)
    }

    /// Read PTY output and fan it out, holding it back until the first
    /// Ready frame flips the buffer to passthrough.
    async fn producer_loop(self: Arc<Self>, reader: PtyReader) {
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return,
                read = reader.read_chunk() => match read {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => return,
                    Err(err) => {
                        debug!(session_id = %self.id, error = %err, "pty read ended");
                        return;
                    }
                },
            };
            if let Some(passthrough) = self.buffer.push(chunk) {
                let frame = protocol::encode_data(&passthrough);
                self.fan_out(&frame);
            }
        }
    }

    /// Non-blocking enqueue of one pre-encoded frame to every subscriber.
    /// A full queue drops the frame for that subscriber only; the PTY is
    /// never throttled by a slow client.
    fn fan_out(&self, frame: &[u8]) {
        let subscribers = self.subscribers.read();
        for subscriber in subscribers.values() {
            let _ = subscriber.tx.try_send(frame.to_vec());
        }
    }

    /// Attach a WebSocket as a new subscriber and start its pumps. On
    /// capacity failure the socket is handed back so the caller can close
    /// it with a meaningful code.
    pub fn add_subscriber(
        self: &Arc<Self>,
        socket: WebSocket,
    ) -> Result<(String, oneshot::Receiver<()>), (WebSocket, ShellError)> {
        let (subscriber_id, stream, writer, rx, cancel, done_rx, total) = {
            let mut subscribers = self.subscribers.write();
            if subscribers.len() >= self.max_subscribers {
                return Err((socket, ShellError::SubscriberCapacity));
            }

            let subscriber_id = new_id();
            let (sink, stream) = socket.split();
            let writer = Arc::new(WsWriter::new(sink));
            let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
            let cancel = self.cancel.child_token();
            let (done_tx, done_rx) = oneshot::channel();

            subscribers.insert(
                subscriber_id.clone(),
                Subscriber {
                    writer: Arc::clone(&writer),
                    tx,
                    cancel: cancel.clone(),
                    done: Some(done_tx),
                },
            );
            let total = subscribers.len();
            (subscriber_id, stream, writer, rx, cancel, done_rx, total)
        };

        self.cancel_inactivity_timer();

        tokio::spawn(Arc::clone(self).write_pump(
            subscriber_id.clone(),
            writer,
            rx,
            cancel.clone(),
        ));
        tokio::spawn(Arc::clone(self).read_pump(subscriber_id.clone(), stream, cancel));

        info!(session_id = %self.id, subscriber_id = %subscriber_id, total, "subscriber added");
        Ok((subscriber_id, done_rx))
    }

    /// Detach a subscriber. Idempotent: both pumps funnel here on any exit
    /// path, and removal from the map is the one-shot guard. The last
    /// subscriber out re-arms the inactivity timer.
    pub fn remove_subscriber(self: &Arc<Self>, subscriber_id: &str) {
        let (mut subscriber, remaining) = {
            let mut subscribers = self.subscribers.write();
            let Some(subscriber) = subscribers.remove(subscriber_id) else {
                return;
            };
            (subscriber, subscribers.len())
        };

        subscriber.cancel.cancel();
        if let Some(done) = subscriber.done.take() {
            let _ = done.send(());
        }

        info!(session_id = %self.id, subscriber_id = %subscriber_id, remaining, "subscriber removed");

        if remaining == 0 && !self.destroyed.load(Ordering::SeqCst) {
            self.arm_inactivity_timer();
        }
    }

    /// Drain the subscriber's outbound queue to its WebSocket.
    async fn write_pump(
        self: Arc<Self>,
        subscriber_id: String,
        writer: Arc<WsWriter>,
        mut rx: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(err) = writer.send_binary(frame).await {
                debug!(session_id = %self.id, subscriber_id = %subscriber_id, error = %err, "write pump error");
                break;
            }
        }
        self.remove_subscriber(&subscriber_id);
    }

    /// Read frames from the subscriber and apply them to the session.
    async fn read_pump(
        self: Arc<Self>,
        subscriber_id: String,
        mut stream: SplitStream<WebSocket>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(message)) => message,
                    Some(Err(_)) | None => break,
                },
            };
            let data = match message {
                Message::Binary(data) => data,
                Message::Close(_) => break,
                _ => continue,
            };
            let Some(frame) = protocol::decode(&data) else {
                continue;
            };
            match frame {
                Frame::Data(payload) => {
                    if let Err(err) = self.pty_writer.write(&payload) {
                        debug!(session_id = %self.id, subscriber_id = %subscriber_id, error = %err, "pty write error");
                        break;
                    }
                }
                Frame::Resize { cols, rows } => {
                    // A spurious resize must never take the session down.
                    if let Err(err) = self.pty.resize(cols, rows) {
                        debug!(session_id = %self.id, error = %err, "resize failed");
                    }
                }
                Frame::Ready => {
                    if let Some(pending) = self.buffer.mark_ready() {
                        if !pending.is_empty() {
                            let frame = protocol::encode_data(&pending);
                            self.fan_out(&frame);
                        }
                    }
                }
            }
        }
        self.remove_subscriber(&subscriber_id);
    }

    /// Tear the session down: close frames to every subscriber, cascade
    /// cancellation, kill the child, deregister. Runs at most once.
    pub async fn destroy(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.id, "destroying session");

        self.cancel_inactivity_timer();

        // Snapshot writers before cancelling: once the token fires the
        // write pumps remove themselves and empty the map, and the close
        // frames would never go out.
        let writers: Vec<Arc<WsWriter>> = self
            .subscribers
            .read()
            .values()
            .map(|subscriber| Arc::clone(&subscriber.writer))
            .collect();
        for writer in &writers {
            writer
                .send_close(close_code::NORMAL, "session destroyed", CLOSE_DEADLINE)
                .await;
        }
        for writer in &writers {
            writer.shutdown(CLOSE_DEADLINE).await;
        }

        self.cancel.cancel();
        self.pty.shutdown();

        (self.on_destroy)(&self.id);
    }

    fn arm_inactivity_timer(self: &Arc<Self>) {
        let mut slot = self.inactivity.lock();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        let session = Arc::clone(self);
        let timeout = self.inactivity_timeout;
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Disarm our own slot first so destroy's cancel path cannot
            // abort this task mid-teardown.
            session.inactivity.lock().take();
            info!(session_id = %session.id, "inactivity timeout, destroying session");
            session.destroy().await;
        }));
    }

    fn cancel_inactivity_timer(&self) {
        if let Some(handle) = self.inactivity.lock().take() {
            handle.abort();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            shell: self.shell.clone(),
            created_at: self.created_at,
            subscriber_count: self.subscriber_count(),
        }
    }
}

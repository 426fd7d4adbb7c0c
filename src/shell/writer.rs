//! Serialized writes to one WebSocket.
//!
//! Close frames race data frames on a shared connection: the write pump, the
//! attach handler, and session destroy may all write concurrently. The sink
//! half therefore lives behind a mutex and every write goes through it.

use std::borrow::Cow;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::Mutex;

pub struct WsWriter {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsWriter {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink: Mutex::new(sink) }
    }

    /// Send a pre-encoded frame as one binary message.
    pub async fn send_binary(&self, frame: Vec<u8>) -> Result<(), axum::Error> {
        self.sink.lock().await.send(Message::Binary(frame)).await
    }

    /// Send a close frame with the given code and reason, bounded by
    /// `deadline` so a wedged peer cannot stall the caller.
    pub async fn send_close(&self, code: u16, reason: &'static str, deadline: Duration) {
        let close = Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        }));
        let _ = tokio::time::timeout(deadline, async {
            let _ = self.sink.lock().await.send(close).await;
        })
        .await;
    }

    /// Close the underlying connection.
    pub async fn shutdown(&self, deadline: Duration) {
        let _ = tokio::time::timeout(deadline, async {
            let _ = self.sink.lock().await.close().await;
        })
        .await;
    }
}

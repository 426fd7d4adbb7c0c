//! Output retention until the first client is ready to render.
//!
//! A fresh session starts producing PTY output (shell banner, prompt) before
//! any client has attached its terminal emulator. `PendingOutput` holds that
//! output until the first Ready frame arrives, then flips to passthrough for
//! the rest of the session's life. The flip happens at most once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

pub struct PendingOutput {
    inner: Mutex<Inner>,
}

struct Inner {
    buf: Vec<u8>,
    direct: bool,
    ready_at: Option<DateTime<Utc>>,
}

impl PendingOutput {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: Vec::new(),
                direct: false,
                ready_at: None,
            }),
        }
    }

    /// Feed a chunk of PTY output. Before the ready transition the chunk is
    /// retained and `None` is returned; afterwards the chunk passes through
    /// unchanged.
    pub fn push(&self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.direct {
            return Some(chunk);
        }
        inner.buf.extend_from_slice(&chunk);
        None
    }

    /// Switch to passthrough. The first call returns everything retained so
    /// far (possibly empty) for flushing; every later call returns `None`.
    pub fn mark_ready(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.direct {
            return None;
        }
        inner.direct = true;
        inner.ready_at = Some(Utc::now());
        Some(std::mem::take(&mut inner.buf))
    }

    /// Instant of the ready transition, if it has happened.
    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().ready_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retains_before_ready() {
        let out = PendingOutput::new();
        assert_eq!(out.push(b"hello".to_vec()), None);
        assert_eq!(out.push(b" world".to_vec()), None);
    }

    #[test]
    fn flushes_accumulation_on_ready() {
        let out = PendingOutput::new();
        out.push(b"hello".to_vec());
        out.push(b" world".to_vec());
        assert_eq!(out.mark_ready(), Some(b"hello world".to_vec()));
    }

    #[test]
    fn passthrough_after_ready() {
        let out = PendingOutput::new();
        out.mark_ready();
        assert_eq!(out.push(b"direct".to_vec()), Some(b"direct".to_vec()));
    }

    #[test]
    fn ready_is_one_shot() {
        let out = PendingOutput::new();
        out.push(b"data".to_vec());
        assert_eq!(out.mark_ready(), Some(b"data".to_vec()));
        assert_eq!(out.mark_ready(), None);
        assert_eq!(out.mark_ready(), None);
    }

    #[test]
    fn empty_flush() {
        let out = PendingOutput::new();
        assert_eq!(out.mark_ready(), Some(Vec::new()));
    }

    #[test]
    fn records_transition_instant() {
        let out = PendingOutput::new();
        assert!(out.ready_at().is_none());
        out.mark_ready();
        assert!(out.ready_at().is_some());
    }
}

//! Interactive shell sessions: PTY-backed processes multiplexed to
//! WebSocket subscribers.

pub mod buffer;
pub mod handler;
pub mod manager;
pub mod protocol;
pub mod pty;
pub mod session;
pub mod writer;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("pty start: {0}")]
    PtyStart(anyhow::Error),
    #[error("max sessions reached")]
    SessionCapacity,
    #[error("max subscribers reached")]
    SubscriberCapacity,
    #[error("session {0} not found")]
    SessionNotFound(String),
}

/// 128-bit random identifier rendered as 32 lowercase hex characters.
pub(crate) fn new_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[cfg(test)]
mod tests {
    use super::new_id;

    #[test]
    fn id_is_32_lowercase_hex() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }
}

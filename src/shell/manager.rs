//! Process-wide session registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use super::session::{DestroyHook, Session, SessionInfo};
use super::{new_id, ShellError};

/// Shell-core tunables. Constructor parameters so tests can shrink them;
/// the defaults are the production values.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub max_sessions: usize,
    pub max_subscribers: usize,
    pub inactivity_timeout: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            max_subscribers: 8,
            inactivity_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    config: ShellConfig,
}

impl SessionManager {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: RwLock::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Create a session running `shell`, enforcing the session cap. The
    /// registration lock is held until the session is inserted, so the
    /// deregistration hook can never run against a missing entry.
    pub fn create(&self, shell: &str) -> Result<Arc<Session>, ShellError> {
        let mut sessions = self.inner.sessions.write();
        if sessions.len() >= self.inner.config.max_sessions {
            return Err(ShellError::SessionCapacity);
        }

        let id = new_id();
        // Weak so a live session never pins its own registry entry.
        let registry = Arc::downgrade(&self.inner);
        let on_destroy: DestroyHook = Box::new(move |session_id: &str| {
            if let Some(inner) = registry.upgrade() {
                inner.sessions.write().remove(session_id);
                info!(session_id = %session_id, "session deregistered");
            }
        });

        let session = Session::spawn(
            id.clone(),
            shell.to_string(),
            self.inner.config.max_subscribers,
            self.inner.config.inactivity_timeout,
            on_destroy,
        )?;
        sessions.insert(id.clone(), Arc::clone(&session));

        info!(session_id = %id, shell, "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.inner
            .sessions
            .read()
            .values()
            .map(|session| session.info())
            .collect()
    }

    pub async fn kill(&self, id: &str) -> Result<(), ShellError> {
        let session = self
            .get(id)
            .ok_or_else(|| ShellError::SessionNotFound(id.to_string()))?;
        session.destroy().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ShellConfig {
        ShellConfig::default()
    }

    #[tokio::test]
    async fn enforces_session_cap() {
        let manager = SessionManager::new(test_config());

        let mut created = Vec::new();
        for _ in 0..4 {
            created.push(manager.create("/bin/sh").expect("create session"));
        }

        assert!(matches!(
            manager.create("/bin/sh"),
            Err(ShellError::SessionCapacity)
        ));

        let victim = created.remove(0);
        manager.kill(&victim.id).await.expect("kill session");
        created.push(manager.create("/bin/sh").expect("create after kill"));

        for session in &created {
            session.destroy().await;
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let manager = SessionManager::new(test_config());
        let session = manager.create("/bin/sh").expect("create session");

        let found = manager.get(&session.id).expect("session by id");
        assert_eq!(found.id, session.id);
        assert_eq!(found.shell, "/bin/sh");
        assert_eq!(found.subscriber_count(), 0);

        session.destroy().await;
    }

    #[tokio::test]
    async fn lists_all_sessions() {
        let manager = SessionManager::new(test_config());
        let first = manager.create("/bin/sh").expect("create first");
        let second = manager.create("/bin/sh").expect("create second");

        let infos = manager.list();
        assert_eq!(infos.len(), 2);
        let ids: Vec<&str> = infos.iter().map(|info| info.session_id.as_str()).collect();
        assert!(ids.contains(&first.id.as_str()));
        assert!(ids.contains(&second.id.as_str()));

        first.destroy().await;
        second.destroy().await;
    }

    #[tokio::test]
    async fn kill_removes_from_registry() {
        let manager = SessionManager::new(test_config());
        let session = manager.create("/bin/sh").expect("create session");

        manager.kill(&session.id).await.expect("kill session");
        assert!(manager.get(&session.id).is_none());
    }

    #[tokio::test]
    async fn kill_unknown_session_fails() {
        let manager = SessionManager::new(test_config());
        assert!(matches!(
            manager.kill("nonexistent").await,
            Err(ShellError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let manager = SessionManager::new(test_config());
        let session = manager.create("/bin/sh").expect("create session");

        session.destroy().await;
        session.destroy().await;
        assert!(manager.get(&session.id).is_none());
    }

    #[tokio::test]
    async fn inactivity_destroys_unattended_session() {
        let manager = SessionManager::new(ShellConfig {
            inactivity_timeout: Duration::from_millis(100),
            ..ShellConfig::default()
        });
        let session = manager.create("/bin/sh").expect("create session");
        let id = session.id.clone();
        drop(session);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while manager.get(&id).is_some() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "inactivity timeout did not fire"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

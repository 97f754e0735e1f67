//! Session registry: the single point of truth mapping session ids to
//! sessions.
//!
//! Creation is lazy — the first reference to an id (attach, input,
//! resize, or the HTTP bootstrap page) spawns its process. At most one
//! process ever exists per id, including under concurrent first-touch.

use super::session::{ConnectionId, Session};
use crate::config::BrokerConfig;
use std::collections::HashMap;
use std::sync::Arc;
use termcast_core::CastResult;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    config: BrokerConfig,
}

impl SessionRegistry {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Return the session for `id`, spawning it on first reference.
    ///
    /// Double-checked under the write lock: concurrent first-touch
    /// callers race to the lock, and only the winner spawns. A spawn
    /// failure registers nothing and propagates to the caller.
    pub async fn get_or_create(&self, id: &str) -> CastResult<Arc<Session>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(id) {
                return Ok(session.clone());
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id) {
            return Ok(session.clone());
        }
        let session = Session::spawn(id, &self.config)?;
        info!(session_id = %id, "session created");
        sessions.insert(id.to_string(), session.clone());
        Ok(session)
    }

    /// Find the session holding `conn` in its viewer set, remove the
    /// viewer from it, and return that session.
    ///
    /// Called on transport close; has no effect on the process or the
    /// replay buffer.
    pub async fn remove_viewer(&self, conn: ConnectionId) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            if session.remove_viewer(conn).await {
                return Some(session.clone());
            }
        }
        None
    }

    /// Collect sessions that have had no viewers and no activity for the
    /// configured idle timeout, killing their process. Returns the ids
    /// removed. A timeout of zero disables collection entirely.
    pub async fn gc(&self) -> Vec<String> {
        if self.config.idle_timeout == 0 {
            return Vec::new();
        }

        let mut sessions = self.sessions.write().await;
        let mut expired = Vec::new();
        for (id, session) in sessions.iter() {
            if session.viewer_count().await == 0
                && session.idle_for().await.as_secs() >= self.config.idle_timeout
            {
                expired.push(id.clone());
            }
        }

        let mut removed = Vec::new();
        for id in expired {
            if let Some(session) = sessions.remove(&id) {
                session.kill();
                warn!(session_id = %id, "session expired (idle, no viewers)");
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            debug!(count = removed.len(), "GC removed sessions");
        }
        removed
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::session::{Viewer, VIEWER_QUEUE_SIZE};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn registry(idle_timeout: u64) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(BrokerConfig {
            port: 0,
            assets_dir: None,
            idle_timeout,
            shell: "/bin/cat".to_string(),
            shell_args: Vec::new(),
            cwd: PathBuf::from("/"),
            env: HashMap::new(),
            cols: 80,
            rows: 30,
        }))
    }

    #[tokio::test]
    async fn concurrent_first_touch_spawns_exactly_one_process() {
        let registry = registry(0);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(
                async move { registry.get_or_create("same").await },
            ));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.expect("join").expect("get_or_create"));
        }

        let first = &sessions[0];
        for session in &sessions[1..] {
            assert!(Arc::ptr_eq(first, session), "all callers share one session");
        }
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn distinct_ids_get_distinct_sessions() {
        let registry = registry(0);
        let a = registry.get_or_create("a").await.expect("a");
        let b = registry.get_or_create("b").await.expect("b");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.count().await, 2);

        // Ids are case-sensitive.
        let upper = registry.get_or_create("A").await.expect("A");
        assert!(!Arc::ptr_eq(&a, &upper));
        assert_eq!(registry.count().await, 3);
    }

    #[tokio::test]
    async fn remove_viewer_finds_the_owning_session() {
        let registry = registry(0);
        let session = registry.get_or_create("owned").await.expect("session");
        let (tx, _rx) = mpsc::channel(VIEWER_QUEUE_SIZE);
        session.attach(Viewer { conn: 7, tx }).await;

        let found = registry.remove_viewer(7).await.expect("owning session");
        assert!(Arc::ptr_eq(&found, &session));
        assert_eq!(session.viewer_count().await, 0);

        assert!(registry.remove_viewer(7).await.is_none(), "already removed");
        assert_eq!(registry.count().await, 1, "session itself survives");
    }

    #[tokio::test]
    async fn gc_collects_only_idle_viewerless_sessions() {
        let registry = registry(1);
        let idle = registry.get_or_create("idle").await.expect("idle");
        let watched = registry.get_or_create("watched").await.expect("watched");
        let (tx, _rx) = mpsc::channel(VIEWER_QUEUE_SIZE);
        watched.attach(Viewer { conn: 1, tx }).await;

        assert!(registry.gc().await.is_empty(), "nothing idle yet");

        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
        // Both sessions are now past the timeout, but "watched" still has
        // a viewer attached and must survive.
        let removed = registry.gc().await;
        assert_eq!(removed, vec!["idle".to_string()]);
        assert_eq!(registry.count().await, 1);
        drop(idle);
    }

    #[tokio::test]
    async fn gc_disabled_keeps_everything() {
        let registry = registry(0);
        registry.get_or_create("kept").await.expect("session");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(registry.gc().await.is_empty());
        assert_eq!(registry.count().await, 1);
    }
}

//! Session registry and identifiers.
//!
//! [`SessionRegistry`] is the single source of truth mapping a session ID to
//! its live [`TerminalSession`]. It is an owned, cloneable handle injected
//! into the server state — never a module-level global — so tests can run
//! multiple independent instances.
//!
//! Each WebSocket connection owns exactly one session, so the registry needs
//! no iteration or broadcast API beyond `kill_all` for shutdown. Removal must
//! be idempotent: socket close and process exit can both race to unregister
//! the same session, and the loser must see a clean no-op.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

pub use session::{SessionEvent, SpawnError, TerminalSession};

/// Generate a session ID: epoch-millis timestamp plus a random suffix.
/// Opaque to clients, unique for the lifetime of the daemon, never reused.
pub fn generate_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", crate::util::now_ms(), &suffix[..8])
}

/// Registering an ID that is already present.
///
/// Should not occur given the ID scheme; the check is defensive.
#[derive(Debug, PartialEq, Eq)]
pub struct DuplicateSessionError(pub String);

impl std::fmt::Display for DuplicateSessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session {} already registered", self.0)
    }
}

impl std::error::Error for DuplicateSessionError {}

/// Maps `session_id → TerminalSession`.
///
/// Cloneable — all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<TerminalSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session under its ID. Fails if the ID is already present.
    pub async fn register(
        &self,
        session: Arc<TerminalSession>,
    ) -> Result<(), DuplicateSessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(DuplicateSessionError(session.id.clone()));
        }
        let id = session.id.clone();
        sessions.insert(id.clone(), session);
        info!("Session {id} registered, total: {}", sessions.len());
        Ok(())
    }

    /// Remove a session. Idempotent — returns whether an entry existed.
    pub async fn unregister(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let existed = sessions.remove(session_id).is_some();
        if existed {
            info!(
                "Session {session_id} unregistered, remaining: {}",
                sessions.len()
            );
        }
        existed
    }

    /// Look up a session, used to route inbound control frames.
    pub async fn get(&self, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Count of active sessions (for `GET /api/info`).
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Kill every registered session (used during shutdown).
    pub async fn kill_all(&self) {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        for (id, session) in sessions.drain() {
            session.kill();
            info!("Session {id} killed (shutdown)");
        }
        if count > 0 {
            info!("Shut down {count} session(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_test_session(id: &str) -> (Arc<TerminalSession>, tokio::sync::mpsc::Receiver<SessionEvent>) {
        let (session, rx) =
            TerminalSession::spawn_pipes(id.to_string(), "/bin/sh", "/", 80, 24, None)
                .expect("spawn /bin/sh");
        (Arc::new(session), rx)
    }

    #[test]
    fn session_ids_are_unique_and_timestamped() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        let (ts, suffix) = a.split_once('-').unwrap();
        assert!(ts.parse::<u64>().is_ok());
        assert_eq!(suffix.len(), 8);
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = spawn_test_session("dup").await;
        let (second, _rx2) = spawn_test_session("dup").await;

        registry.register(Arc::clone(&first)).await.unwrap();
        let err = registry.register(Arc::clone(&second)).await.unwrap_err();
        assert_eq!(err, DuplicateSessionError("dup".to_string()));

        first.kill();
        second.kill();
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let (session, _rx) = spawn_test_session("once").await;
        registry.register(Arc::clone(&session)).await.unwrap();

        // Socket close and process exit can both try to remove the entry;
        // only the first may observe it.
        assert!(registry.unregister("once").await);
        assert!(!registry.unregister("once").await);
        assert!(registry.get("once").await.is_none());

        session.kill();
    }

    #[tokio::test]
    async fn get_routes_to_registered_session() {
        let registry = SessionRegistry::new();
        let (session, _rx) = spawn_test_session("route").await;
        registry.register(Arc::clone(&session)).await.unwrap();

        let found = registry.get("route").await.expect("present");
        assert_eq!(found.id, "route");
        assert_eq!(registry.count().await, 1);

        registry.kill_all().await;
        assert_eq!(registry.count().await, 0);
    }
}

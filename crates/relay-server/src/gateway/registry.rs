//! Registry of live sessions.
//!
//! Mutated by the accept path and by session teardown; read by fan-out and
//! shutdown. All methods are synchronous and never hold the lock across an
//! await, so they are safe to call from `Drop`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::SessionId;

use super::session::Session;

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, Arc<Session>>,
    closed: bool,
}

/// Set of sessions currently attached to the gateway.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    /// Create an empty, open registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Returns `false` once the registry has been closed.
    pub fn insert(&self, session: Arc<Session>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        let _ = inner.sessions.insert(session.id().clone(), session);
        true
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner.lock().sessions.remove(id)
    }

    /// Look up one session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner.lock().sessions.get(id).cloned()
    }

    /// Point-in-time copy of every live session.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further inserts and return the sessions live at that moment.
    ///
    /// Any accept racing with this call either lands before it (and is in
    /// the returned set) or is refused.
    pub fn close(&self) -> Vec<Arc<Session>> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.sessions.values().cloned().collect()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

use std::sync::{Arc, Weak};

use ahash::{AHashMap, AHashSet};
use tokio::sync::RwLock;

use super::session::SessionId;

/// Keeps a session alive in the [`SessionManager`] for as long as it exists.
#[derive(Debug)]
pub struct SessionHandle(());

/// Hands out session ids and tracks which sessions are alive.
///
/// A session is alive until it is removed or its [`SessionHandle`] is dropped.
#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug)]
struct Inner {
    live: AHashMap<SessionId, Weak<SessionHandle>>,
    session_index: u64,
}

/// The sessions alive at one instant.
///
/// Ids handed out after the snapshot was taken count as alive.
#[derive(Debug, Clone)]
pub struct LiveSessions {
    ids: AHashSet<SessionId>,
    next_id: u64,
}

impl LiveSessions {
    pub fn contains(&self, id: &SessionId) -> bool {
        id.get() >= self.next_id || self.ids.contains(id)
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        SessionManager {
            inner: Arc::new(RwLock::new(Inner {
                live: Default::default(),
                session_index: 1,
            })),
        }
    }
}

impl SessionManager {
    /// Registers a new session and returns its id together with the handle keeping it alive.
    pub async fn new_session(&self) -> (SessionId, Arc<SessionHandle>) {
        let inner = &mut *self.inner.write().await;
        let id = inner.next_session_id();
        let handle = Arc::new(SessionHandle(()));
        inner.live.insert(id, Arc::downgrade(&handle));
        (id, handle)
    }

    /// Marks the session as gone. Returns `false` if it was not live.
    pub async fn remove_session(&self, id: SessionId) -> bool {
        self.inner.write().await.live.remove(&id).is_some()
    }

    pub async fn is_live(&self, id: SessionId) -> bool {
        self.inner
            .read()
            .await
            .live
            .get(&id)
            .map(|handle| handle.strong_count() > 0)
            .unwrap_or_default()
    }

    /// Forgets sessions whose handle was dropped and returns the remaining live set,
    /// together with the number of forgotten sessions.
    pub async fn prune(&self) -> (LiveSessions, usize) {
        let inner = &mut *self.inner.write().await;
        let before = inner.live.len();
        inner.live.retain(|_, handle| handle.strong_count() > 0);
        let dropped = before - inner.live.len();

        let live = LiveSessions {
            ids: inner.live.keys().copied().collect(),
            next_id: inner.session_index,
        };
        (live, dropped)
    }
}

impl Inner {
    /// Returns the next sequential identifier for a session.
    fn next_session_id(&mut self) -> SessionId {
        loop {
            let raw = self.session_index;
            self.session_index = self.session_index.wrapping_add(1);
            // zero is skipped, it is not a valid session id
            if let Some(id) = SessionId::new(raw) {
                return id;
            }
        }
    }
}

use std::{fmt, num::NonZeroU64, sync::Arc};

use cid::Cid;

use super::{session_manager::SessionHandle, Client};
use crate::{message::Priority, Store};

/// Identifies a group of wants issued by one requester.
///
/// Zero is reserved: cancelling "for every session" is a separate
/// administrative operation and not a session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(NonZeroU64);

impl SessionId {
    /// Returns `None` for `0`, which callers use to mean "all sessions".
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(SessionId)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A handle for a requester's wants.
///
/// Wants issued through the session are owned by it; [`Session::close`] drops
/// them all at once. Dropping the session without closing it leaves its wants
/// to the client's sweep.
#[derive(Debug)]
pub struct Session<S: Store> {
    id: SessionId,
    default_priority: Priority,
    client: Client<S>,
    _handle: Arc<SessionHandle>,
}

impl<S: Store> Session<S> {
    pub(super) fn new(
        id: SessionId,
        handle: Arc<SessionHandle>,
        default_priority: Priority,
        client: Client<S>,
    ) -> Self {
        Session {
            id,
            default_priority,
            client,
            _handle: handle,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Wants the given blocks at the default priority.
    pub async fn want_blocks(&self, keys: &[Cid]) {
        self.want_blocks_with_priority(keys, self.default_priority)
            .await
    }

    pub async fn want_blocks_with_priority(&self, keys: &[Cid], priority: Priority) {
        self.client.want_blocks(keys, priority, self.id).await
    }

    /// Asks peers only whether they have the blocks.
    pub async fn want_haves(&self, keys: &[Cid]) {
        self.client
            .want_haves(keys, self.default_priority, self.id)
            .await
    }

    pub async fn cancel_wants(&self, keys: &[Cid]) {
        self.client.cancel_wants(keys, self.id).await
    }

    /// Tears the session down, cancelling all of its outstanding wants.
    pub async fn close(self) {
        self.client.remove_session(self.id).await
    }
}

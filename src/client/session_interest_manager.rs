use std::{cmp::Reverse, sync::Arc};

use ahash::AHashMap;
use cid::Cid;
use tokio::sync::RwLock;
use tracing::debug;

use super::session::SessionId;
use super::session_manager::LiveSessions;
use super::wantlist::Entry;
use crate::message::{Priority, WantType};

/// The local wantlist, attributed to the sessions that asked for each block.
///
/// A cid stays on the wantlist as long as at least one session wants it.
/// Every mutation happens under a single write lock, so a cancel racing a
/// block arrival for the same cid resolves to exactly one of the two.
#[derive(Default, Debug, Clone)]
pub struct SessionInterestManager {
    wants: Arc<RwLock<LocalWants>>,
}

#[derive(Default, Debug)]
struct LocalWants {
    /// Map of cids -> sessions -> want.
    entries: AHashMap<Cid, LocalWant>,
    next_seq: u64,
}

#[derive(Debug)]
struct LocalWant {
    sessions: AHashMap<SessionId, SessionWant>,
    /// Arrival order of the first want, used to break priority ties.
    seq: u64,
}

/// A want taken off the wantlist by an arriving block, until the block is stored.
#[derive(Debug)]
pub struct ClaimedWant {
    key: Cid,
    want: LocalWant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SessionWant {
    priority: Priority,
    want_type: WantType,
}

impl LocalWant {
    /// The want as seen by peers: the highest priority any session asked for,
    /// and a want-block if any session wants the block itself.
    fn aggregate(&self) -> Option<SessionWant> {
        self.sessions.values().copied().reduce(|a, b| SessionWant {
            priority: a.priority.max(b.priority),
            want_type: if a.want_type == WantType::Block || b.want_type == WantType::Block {
                WantType::Block
            } else {
                WantType::Have
            },
        })
    }
}

impl LocalWants {
    /// Removes `session` from the given keys, returning the keys no session wants anymore.
    fn remove_session_from(&mut self, session: SessionId, keys: &[Cid]) -> Vec<Cid> {
        let mut deleted_keys = Vec::new();
        for key in keys {
            if let Some(want) = self.entries.get_mut(key) {
                want.sessions.remove(&session);
                if want.sessions.is_empty() {
                    deleted_keys.push(*key);
                }
            }
        }

        // cleanup
        for key in &deleted_keys {
            self.entries.remove(key);
        }

        deleted_keys
    }
}

impl SessionInterestManager {
    /// When a session asks for blocks, this records its interest.
    ///
    /// Returns the entries whose aggregated want changed and need to be announced.
    pub async fn record_session_interest(
        &self,
        session: SessionId,
        keys: &[Cid],
        priority: Priority,
        want_type: WantType,
    ) -> Vec<Entry> {
        debug!("session:{} record_session_interest: {:?}", session, keys);
        let wants = &mut *self.wants.write().await;

        let mut changed = Vec::new();
        for key in keys {
            let next_seq = &mut wants.next_seq;
            let want = wants.entries.entry(*key).or_insert_with(|| {
                let seq = *next_seq;
                *next_seq += 1;
                LocalWant {
                    sessions: Default::default(),
                    seq,
                }
            });

            let before = want.aggregate();
            let session_want = want.sessions.entry(session).or_insert(SessionWant {
                priority,
                want_type,
            });
            session_want.priority = priority;
            // a want-have never downgrades a want-block
            if want_type == WantType::Block {
                session_want.want_type = WantType::Block;
            }
            let after = want.aggregate();

            if before != after {
                if let Some(after) = after {
                    changed.push(Entry::new(*key, after.priority, after.want_type));
                }
            }
        }

        changed
    }

    /// When the session shuts down, this is called.
    /// Returns the keys that no session is interested in anymore.
    pub async fn remove_session(&self, session: SessionId) -> Vec<Cid> {
        debug!("session:{}: remove_session", session);
        let wants = &mut *self.wants.write().await;

        let keys: Vec<Cid> = wants
            .entries
            .iter()
            .filter(|(_, want)| want.sessions.contains_key(&session))
            .map(|(key, _)| *key)
            .collect();
        wants.remove_session_from(session, &keys)
    }

    /// Called when a request is cancelled.
    /// Returns the keys that no session is interested in anymore.
    pub async fn remove_session_interested(&self, session: SessionId, keys: &[Cid]) -> Vec<Cid> {
        debug!(
            "session:{}: remove_session_interested: {:?}",
            session,
            keys.iter().map(|s| s.to_string()).collect::<Vec<_>>()
        );
        self.wants.write().await.remove_session_from(session, keys)
    }

    /// Drops the given keys for every session.
    /// Returns the keys that were actually wanted.
    pub async fn remove_interest_all_sessions(&self, keys: &[Cid]) -> Vec<Cid> {
        let wants = &mut *self.wants.write().await;
        keys.iter()
            .filter(|key| wants.entries.remove(*key).is_some())
            .copied()
            .collect()
    }

    /// Called when a block arrives. Removes the key for all sessions and returns the want,
    /// if anyone wanted it.
    ///
    /// At most one caller claims a given want.
    pub async fn receive_block(&self, key: &Cid) -> Option<ClaimedWant> {
        self.wants
            .write()
            .await
            .entries
            .remove(key)
            .map(|want| ClaimedWant { key: *key, want })
    }

    /// Puts a claimed want back, merging it with wants recorded since the claim.
    pub async fn restore(&self, claimed: ClaimedWant) {
        let ClaimedWant { key, want } = claimed;
        debug!("restoring want for {}", key);
        let wants = &mut *self.wants.write().await;
        match wants.entries.get_mut(&key) {
            Some(current) => {
                current.seq = current.seq.min(want.seq);
                for (session, session_want) in want.sessions {
                    current.sessions.entry(session).or_insert(session_want);
                }
            }
            None => {
                wants.entries.insert(key, want);
            }
        }
    }

    pub async fn is_wanted(&self, key: &Cid) -> bool {
        self.wants.read().await.entries.contains_key(key)
    }

    /// Returns whether `session` currently wants `key`.
    pub async fn session_wants(&self, session: SessionId, key: &Cid) -> bool {
        self.wants
            .read()
            .await
            .entries
            .get(key)
            .map(|want| want.sessions.contains_key(&session))
            .unwrap_or_default()
    }

    /// The local wantlist, sorted descending by priority, oldest first on ties.
    pub async fn wantlist(&self) -> Vec<Entry> {
        let wants = &*self.wants.read().await;
        let mut entries: Vec<_> = wants
            .entries
            .iter()
            .filter_map(|(key, want)| want.aggregate().map(|agg| (*key, agg, want.seq)))
            .collect();
        entries.sort_by_key(|(_, agg, seq)| (Reverse(agg.priority), *seq));
        entries
            .into_iter()
            .map(|(key, agg, _)| Entry::new(key, agg.priority, agg.want_type))
            .collect()
    }

    /// Removes the interest of every session not in `live`.
    /// Returns the keys that no session is interested in anymore.
    pub async fn sweep_sessions(&self, live: &LiveSessions) -> Vec<Cid> {
        let wants = &mut *self.wants.write().await;

        let mut deleted_keys = Vec::new();
        for (key, want) in wants.entries.iter_mut() {
            want.sessions.retain(|session, _| live.contains(session));
            if want.sessions.is_empty() {
                deleted_keys.push(*key);
            }
        }
        for key in &deleted_keys {
            wants.entries.remove(key);
        }

        deleted_keys
    }
}

#[cfg(test)]
mod tests {
    use crate::block::tests::create_block;

    use super::super::session_manager::SessionManager;
    use super::*;

    fn sid(raw: u64) -> SessionId {
        SessionId::new(raw).unwrap()
    }

    fn cids(n: usize) -> Vec<Cid> {
        (0..n)
            .map(|i| create_block(format!("block {i}").into_bytes()).cid)
            .collect()
    }

    #[tokio::test]
    async fn test_rewant_is_idempotent() {
        let sim = SessionInterestManager::default();
        let keys = cids(2);

        let changed = sim
            .record_session_interest(sid(1), &keys, 1, WantType::Block)
            .await;
        assert_eq!(changed.len(), 2);

        let changed = sim
            .record_session_interest(sid(1), &keys, 1, WantType::Block)
            .await;
        assert!(changed.is_empty());
        assert_eq!(sim.wantlist().await.len(), 2);

        // a new priority is announced again
        let changed = sim
            .record_session_interest(sid(1), &keys[..1], 5, WantType::Block)
            .await;
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].priority, 5);
    }

    #[tokio::test]
    async fn test_cancel_from_other_session_is_ignored() {
        let sim = SessionInterestManager::default();
        let keys = cids(1);

        sim.record_session_interest(sid(1), &keys, 1, WantType::Block)
            .await;
        let cancelled = sim.remove_session_interested(sid(2), &keys).await;
        assert!(cancelled.is_empty());
        assert!(sim.is_wanted(&keys[0]).await);
    }

    #[tokio::test]
    async fn test_shared_interest() {
        let sim = SessionInterestManager::default();
        let keys = cids(1);

        sim.record_session_interest(sid(1), &keys, 1, WantType::Block)
            .await;
        sim.record_session_interest(sid(2), &keys, 3, WantType::Have)
            .await;

        let wl = sim.wantlist().await;
        assert_eq!(wl.len(), 1);
        assert_eq!(wl[0].priority, 3);
        assert_eq!(wl[0].want_type, WantType::Block);

        assert!(sim.remove_session_interested(sid(1), &keys).await.is_empty());
        assert!(sim.is_wanted(&keys[0]).await);
        assert_eq!(sim.remove_session_interested(sid(2), &keys).await, keys);
        assert!(!sim.is_wanted(&keys[0]).await);
    }

    #[tokio::test]
    async fn test_receive_removes_for_all_sessions() {
        let sim = SessionInterestManager::default();
        let keys = cids(1);

        sim.record_session_interest(sid(1), &keys, 1, WantType::Block)
            .await;
        sim.record_session_interest(sid(2), &keys, 1, WantType::Block)
            .await;

        assert!(sim.receive_block(&keys[0]).await.is_some());
        assert!(sim.receive_block(&keys[0]).await.is_none());
        assert!(sim.wantlist().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_claimed_want() {
        let sim = SessionInterestManager::default();
        let keys = cids(2);

        sim.record_session_interest(sid(1), &keys, 1, WantType::Block)
            .await;
        let claimed = sim.receive_block(&keys[0]).await.unwrap();
        assert!(!sim.is_wanted(&keys[0]).await);

        // another session wants it while the block is being stored
        sim.record_session_interest(sid(2), &keys[..1], 4, WantType::Have)
            .await;
        sim.restore(claimed).await;

        assert!(sim.session_wants(sid(1), &keys[0]).await);
        assert!(sim.session_wants(sid(2), &keys[0]).await);
        // the original arrival order is kept
        let order: Vec<_> = sim.wantlist().await.into_iter().map(|e| e.cid).collect();
        assert_eq!(order, vec![keys[0], keys[1]]);
        assert_eq!(sim.wantlist().await[0].want_type, WantType::Block);
    }

    #[tokio::test]
    async fn test_remove_session() {
        let sim = SessionInterestManager::default();
        let keys = cids(3);

        sim.record_session_interest(sid(1), &keys, 1, WantType::Block)
            .await;
        sim.record_session_interest(sid(2), &keys[..1], 1, WantType::Block)
            .await;

        let mut removed = sim.remove_session(sid(1)).await;
        removed.sort();
        let mut expected = keys[1..].to_vec();
        expected.sort();
        assert_eq!(removed, expected);
        assert!(sim.session_wants(sid(2), &keys[0]).await);
    }

    #[tokio::test]
    async fn test_sweep_sessions() {
        let sim = SessionInterestManager::default();
        let keys = cids(2);

        sim.record_session_interest(sid(1), &keys[..1], 1, WantType::Block)
            .await;
        sim.record_session_interest(sid(2), &keys[1..], 1, WantType::Block)
            .await;

        let sm = SessionManager::default();
        let (first, handle) = sm.new_session().await;
        let (second, _handle) = sm.new_session().await;
        assert_eq!((first, second), (sid(1), sid(2)));
        drop(handle);

        let (live, _) = sm.prune().await;
        assert_eq!(sim.sweep_sessions(&live).await, keys[..1].to_vec());
        assert_eq!(sim.wantlist().await.len(), 1);

        // a session created after the snapshot keeps its wants
        sim.record_session_interest(sid(3), &keys[..1], 1, WantType::Block)
            .await;
        assert!(sim.sweep_sessions(&live).await.is_empty());
    }

    #[tokio::test]
    async fn test_wantlist_order() {
        let sim = SessionInterestManager::default();
        let keys = cids(3);

        sim.record_session_interest(sid(1), &keys[..1], 1, WantType::Block)
            .await;
        sim.record_session_interest(sid(1), &keys[1..2], 7, WantType::Block)
            .await;
        sim.record_session_interest(sid(1), &keys[2..], 1, WantType::Block)
            .await;

        let order: Vec<_> = sim.wantlist().await.into_iter().map(|e| e.cid).collect();
        assert_eq!(order, vec![keys[1], keys[0], keys[2]]);
    }
}

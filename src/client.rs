//! The want side of the exchange: the local wantlist, sessions and announcements to peers.

use std::sync::Arc;

use ahash::AHashSet;
use anyhow::{Context, Result};
use cid::Cid;
use iroh_metrics::{inc, inc_by};
use libp2p::PeerId;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    block::Block,
    config::ClientConfig,
    message::{BitswapMessage, Priority, WantType},
    metrics::Metrics,
    network::Network,
    stat::StatAggregator,
    Store,
};

use self::{
    block_presence_manager::BlockPresenceManager,
    session::{Session, SessionId},
    session_interest_manager::SessionInterestManager,
    session_manager::SessionManager,
    wantlist::Entry,
};

mod block_presence_manager;
pub mod session;
mod session_interest_manager;
mod session_manager;
pub mod wantlist;

/// The outcome of receiving a single block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBlock {
    pub block: Block,
    /// The block was on the local wantlist and not yet in the store.
    pub useful: bool,
    /// The block was put into the store by this receive.
    pub newly_stored: bool,
}

/// The outcome of receiving a batch of blocks.
#[derive(Debug, Default)]
pub struct ReceivedBlocks {
    pub received: Vec<ReceivedBlock>,
    /// Blocks that could not be checked or stored, with the store error.
    pub failed: Vec<(Cid, anyhow::Error)>,
}

#[derive(Debug, Clone)]
pub struct Client<S: Store> {
    inner: Arc<Inner<S>>,
}

#[derive(Debug)]
struct Inner<S: Store> {
    store: S,
    network: Arc<dyn Network>,
    session_interest_manager: SessionInterestManager,
    block_presence_manager: BlockPresenceManager,
    session_manager: SessionManager,
    /// Peers we are connected to, wants are announced to all of them.
    peers: RwLock<AHashSet<PeerId>>,
    stats: Arc<StatAggregator>,
    config: ClientConfig,
    closer: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Store> Client<S> {
    pub async fn new(
        network: Arc<dyn Network>,
        store: S,
        stats: Arc<StatAggregator>,
        config: ClientConfig,
    ) -> Self {
        let client = Client {
            inner: Arc::new(Inner {
                store,
                network,
                session_interest_manager: Default::default(),
                block_presence_manager: Default::default(),
                session_manager: Default::default(),
                peers: Default::default(),
                stats,
                config,
                closer: CancellationToken::new(),
                workers: Default::default(),
            }),
        };

        let sweep_interval = client.inner.config.want_sweep_interval;
        if !sweep_interval.is_zero() {
            let worker = client.clone();
            let closer = client.inner.closer.clone();
            let handle = tokio::task::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                // the first tick completes immediately
                ticker.tick().await;
                loop {
                    tokio::select! {
                        biased;
                        _ = closer.cancelled() => break,
                        _ = ticker.tick() => {
                            worker.sweep().await;
                        }
                    }
                }
            });
            client.inner.workers.lock().await.push(handle);
        }

        client
    }

    /// Shuts down the background sweeper.
    pub async fn stop(&self) -> Result<()> {
        self.inner.closer.cancel();
        let workers: Vec<_> = self.inner.workers.lock().await.drain(..).collect();
        for worker in workers {
            worker.await.context("client worker panicked")?;
        }
        Ok(())
    }

    /// Creates a new session, owning the wants issued through it.
    pub async fn new_session(&self) -> Session<S> {
        let (id, handle) = self.inner.session_manager.new_session().await;
        inc!(Metrics, sessions_created);
        debug!("session:{}: created", id);
        Session::new(id, handle, self.inner.config.default_priority, self.clone())
    }

    /// Tears a session down, cancelling every want it owns.
    pub async fn remove_session(&self, session: SessionId) {
        if self.inner.session_manager.remove_session(session).await {
            inc!(Metrics, sessions_destroyed);
        }
        let cancelled = self
            .inner
            .session_interest_manager
            .remove_session(session)
            .await;
        self.broadcast_cancels(&cancelled).await;
    }

    /// Adds the given keys to the local wantlist and announces them.
    pub async fn want_blocks(&self, keys: &[Cid], priority: Priority, session: SessionId) {
        self.want(keys, priority, WantType::Block, session).await
    }

    /// Asks peers whether they have the given keys, without requesting the blocks.
    pub async fn want_haves(&self, keys: &[Cid], priority: Priority, session: SessionId) {
        self.want(keys, priority, WantType::Have, session).await
    }

    async fn want(&self, keys: &[Cid], priority: Priority, want_type: WantType, session: SessionId) {
        if keys.is_empty() {
            return;
        }
        if !self.inner.session_manager.is_live(session).await {
            debug!("session:{}: ignoring wants of closed session", session);
            return;
        }
        let changed = self
            .inner
            .session_interest_manager
            .record_session_interest(session, keys, priority, want_type)
            .await;
        if changed.is_empty() {
            return;
        }

        for peer in self.peers().await {
            // skip peers that told us they do not have the block
            let available: AHashSet<Cid> = self
                .inner
                .block_presence_manager
                .filter_unavailable(&peer, changed.iter().map(|e| &e.cid))
                .await
                .into_iter()
                .collect();
            if available.is_empty() {
                continue;
            }

            let mut msg = BitswapMessage::new(false);
            for entry in changed.iter().filter(|e| available.contains(&e.cid)) {
                msg.add_entry(entry.cid, entry.priority, entry.want_type, true);
            }
            self.send(peer, msg).await;
        }
    }

    /// Cancels the wants of `session` for the given keys.
    ///
    /// Peers only hear about it once no other session wants a key anymore.
    pub async fn cancel_wants(&self, keys: &[Cid], session: SessionId) {
        let cancelled = self
            .inner
            .session_interest_manager
            .remove_session_interested(session, keys)
            .await;
        self.broadcast_cancels(&cancelled).await;
    }

    /// Cancels the given keys for every session.
    pub async fn cancel_wants_for_all_sessions(&self, keys: &[Cid]) {
        warn!("cancelling {} wants for all sessions", keys.len());
        let cancelled = self
            .inner
            .session_interest_manager
            .remove_interest_all_sessions(keys)
            .await;
        self.broadcast_cancels(&cancelled).await;
    }

    /// Removes wants that are owned by sessions which were closed or dropped.
    pub async fn sweep(&self) -> usize {
        let (live, dropped) = self.inner.session_manager.prune().await;
        if dropped > 0 {
            debug!("{} sessions dropped without closing", dropped);
            inc_by!(Metrics, sessions_destroyed, dropped as u64);
        }
        let swept = self
            .inner
            .session_interest_manager
            .sweep_sessions(&live)
            .await;
        if !swept.is_empty() {
            debug!("swept {} orphaned wants", swept.len());
            inc_by!(Metrics, orphan_wants_swept, swept.len() as u64);
            self.broadcast_cancels(&swept).await;
        }
        swept.len()
    }

    /// Processes blocks received from `from`.
    ///
    /// Wanted blocks are removed from the local wantlist for all sessions. Every block not yet
    /// in the store is put there, but only blocks that were wanted count as useful.
    ///
    /// A block the store fails on is skipped and keeps its want; the rest of the batch is
    /// still processed.
    pub async fn receive_blocks(&self, from: &PeerId, blocks: &[Block]) -> ReceivedBlocks {
        let mut out = ReceivedBlocks::default();
        let mut wanted = Vec::new();

        for block in blocks {
            match self.receive_block(from, block).await {
                Ok((received, claimed)) => {
                    if claimed {
                        wanted.push(block.cid);
                    }
                    out.received.push(received);
                }
                Err(err) => {
                    warn!("failed to receive block {} from {}: {:?}", block.cid, from, err);
                    inc!(Metrics, store_errors);
                    out.failed.push((block.cid, err));
                }
            }
        }

        // nobody needs to send us these anymore
        self.broadcast_cancels(&wanted).await;

        out
    }

    /// Returns the outcome and whether this call took the block off the wantlist.
    async fn receive_block(&self, from: &PeerId, block: &Block) -> Result<(ReceivedBlock, bool)> {
        let store = &self.inner.store;
        // checked before claiming the want, so a concurrent receive that stores the block
        // after our claim does not turn it into a duplicate
        let already_stored = store
            .has(&block.cid)
            .await
            .with_context(|| format!("failed to check store for {}", block.cid))?;

        let claimed = self
            .inner
            .session_interest_manager
            .receive_block(&block.cid)
            .await;

        if !already_stored {
            if let Err(err) = store.put(block.clone()).await {
                if let Some(claimed) = claimed {
                    self.inner.session_interest_manager.restore(claimed).await;
                }
                return Err(err).with_context(|| format!("failed to store {}", block.cid));
            }
        }

        let useful = claimed.is_some() && !already_stored;
        self.inner.stats.record_received(block.len(), useful).await;
        if useful {
            inc!(Metrics, blocks_received);
            inc_by!(Metrics, block_bytes_received, block.len() as u64);
        } else {
            debug!("duplicate block {} from {}", block.cid, from);
            inc!(Metrics, dup_blocks_received);
            inc_by!(Metrics, dup_bytes_received, block.len() as u64);
        }

        let received = ReceivedBlock {
            block: block.clone(),
            useful,
            newly_stored: !already_stored,
        };
        Ok((received, claimed.is_some()))
    }

    /// Removes locally produced blocks from the wantlist.
    pub async fn notify_new_blocks(&self, blocks: &[Block]) {
        let mut wanted = Vec::new();
        for block in blocks {
            if self
                .inner
                .session_interest_manager
                .receive_block(&block.cid)
                .await
                .is_some()
            {
                wanted.push(block.cid);
            }
        }
        self.broadcast_cancels(&wanted).await;
    }

    /// Records HAVE and DONT_HAVE responses for keys we still want.
    pub async fn receive_presences(&self, from: &PeerId, haves: &[Cid], dont_haves: &[Cid]) {
        let sim = &self.inner.session_interest_manager;
        let mut wanted_haves = Vec::new();
        for key in haves {
            if sim.is_wanted(key).await {
                wanted_haves.push(*key);
            }
        }
        let mut wanted_dont_haves = Vec::new();
        for key in dont_haves {
            if sim.is_wanted(key).await {
                wanted_dont_haves.push(*key);
            }
        }

        self.inner
            .block_presence_manager
            .receive_from(from, &wanted_haves, &wanted_dont_haves)
            .await;
    }

    /// Returns whether `peer` told us it has `key`.
    pub async fn peer_has_block(&self, peer: &PeerId, key: &Cid) -> bool {
        self.inner
            .block_presence_manager
            .peer_has_block(peer, key)
            .await
    }

    /// Returns whether `peer` told us it does not have `key`.
    pub async fn peer_does_not_have_block(&self, peer: &PeerId, key: &Cid) -> bool {
        self.inner
            .block_presence_manager
            .peer_does_not_have_block(peer, key)
            .await
    }

    /// The local wantlist, highest priority first.
    pub async fn get_wantlist(&self) -> Vec<Entry> {
        self.inner.session_interest_manager.wantlist().await
    }

    /// Returns whether `session` currently wants `key`.
    pub async fn session_wants(&self, session: SessionId, key: &Cid) -> bool {
        self.inner
            .session_interest_manager
            .session_wants(session, key)
            .await
    }

    /// Sends the full local wantlist to a newly connected peer.
    pub async fn peer_connected(&self, peer: &PeerId) {
        if !self.inner.peers.write().await.insert(*peer) {
            return;
        }

        let wantlist = self.get_wantlist().await;
        if wantlist.is_empty() {
            return;
        }
        let mut msg = BitswapMessage::new(true);
        for entry in wantlist {
            msg.add_entry(entry.cid, entry.priority, entry.want_type, true);
        }
        self.send(*peer, msg).await;
    }

    pub async fn peer_disconnected(&self, peer: &PeerId) {
        self.inner.peers.write().await.remove(peer);
        self.inner.block_presence_manager.remove_peer(peer).await;
    }

    async fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.read().await.iter().copied().collect()
    }

    async fn broadcast_cancels(&self, keys: &[Cid]) {
        if keys.is_empty() {
            return;
        }
        self.inner.block_presence_manager.remove_keys(keys).await;

        for peer in self.peers().await {
            let mut msg = BitswapMessage::new(false);
            for key in keys {
                msg.cancel(*key);
            }
            self.send(peer, msg).await;
        }
    }

    async fn send(&self, peer: PeerId, msg: BitswapMessage) {
        if let Err(err) = self.inner.network.send_message(peer, msg).await {
            warn!("failed to send wants to {}: {:?}", peer, err);
            inc!(Metrics, announce_errors);
        }
    }
}

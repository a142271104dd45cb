use std::{
    fmt::Debug,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::{AHashMap, AHashSet};
use anyhow::Result;
use cid::Cid;
use iroh_metrics::inc_by;
use libp2p::PeerId;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    block::Block,
    client::wantlist::Entry as WantlistEntry,
    config::ServerConfig,
    message::{BitswapMessage, BlockPresence, BlockPresenceType, Entry, Priority, WantType},
    metrics::Metrics,
    peer_task_queue::{PeerScore, PeerTaskQueue, Task},
    Store,
};

use super::{
    blockstore_manager::BlockstoreManager,
    ledger::Ledger,
    peer_ledger::PeerLedger,
    score_ledger::{ReciprocityPolicy, Receipt},
    task_merger::{TaskData, TaskMerger},
};

/// Used to accept / deny requests for a CID coming from a PeerID.
/// It should return true if the request should be fulfilled.
pub trait PeerBlockRequestFilter: Fn(&PeerId, &Cid) -> bool + Send + Sync + 'static {}

impl<F: Fn(&PeerId, &Cid) -> bool + Send + Sync + 'static> PeerBlockRequestFilter for F {}

/// What a scheduled send answers a want with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObligationKind {
    Block,
    Have,
    DontHave,
}

/// A scheduled (peer, cid) send decision awaiting transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obligation {
    pub peer: PeerId,
    pub cid: Cid,
    pub priority: Priority,
    pub kind: ObligationKind,
    /// Estimated number of bytes the response takes.
    pub size: usize,
}

impl Obligation {
    fn from_task(peer: PeerId, task: &Task<Cid, TaskData>) -> Self {
        let kind = match (task.data.have_block, task.data.is_want_block) {
            (true, true) => ObligationKind::Block,
            (true, false) => ObligationKind::Have,
            (false, _) => ObligationKind::DontHave,
        };
        Obligation {
            peer,
            cid: task.topic,
            priority: Priority::try_from(task.priority).unwrap_or(Priority::MAX),
            kind,
            size: task.work,
        }
    }
}

/// Contains a message for a specific peer.
#[derive(Debug)]
pub struct Envelope {
    pub peer: PeerId,
    pub message: BitswapMessage,
    pub sent_tasks: Vec<Task<Cid, TaskData>>,
}

pub struct Engine<S: Store> {
    /// Priority queue of requests received from peers.
    peer_task_queue: PeerTaskQueue<Cid, TaskData, TaskMerger>,
    blockstore_manager: BlockstoreManager<S>,
    ledger_map: RwLock<AHashMap<PeerId, Arc<Mutex<Ledger>>>>,
    /// Tracks which peers are waiting for a Cid.
    peer_ledger: Mutex<PeerLedger>,
    policy: Arc<dyn ReciprocityPolicy>,
    target_message_size: usize,
    /// The maximum size of the block, in bytes, up to which we will
    /// replace a want-have with a want-block.
    max_block_size_replace_has_with_block: usize,
    send_dont_haves: bool,
    ledger_retention: Duration,
    peer_block_request_filter: Option<Arc<dyn PeerBlockRequestFilter>>,
}

impl<S: Store> Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("peer_task_queue", &self.peer_task_queue)
            .field("blockstore_manager", &self.blockstore_manager)
            .field("ledger_map", &self.ledger_map)
            .field("peer_ledger", &self.peer_ledger)
            .field("policy", &self.policy)
            .field("target_message_size", &self.target_message_size)
            .field(
                "max_block_size_replace_has_with_block",
                &self.max_block_size_replace_has_with_block,
            )
            .field("send_dont_haves", &self.send_dont_haves)
            .field("ledger_retention", &self.ledger_retention)
            .field(
                "peer_block_request_filter",
                &self
                    .peer_block_request_filter
                    .as_ref()
                    .map(|_| "Arc<dyn PeerBlockRequestFilter>"),
            )
            .finish()
    }
}

impl<S: Store> Engine<S> {
    pub fn new(
        store: S,
        config: &ServerConfig,
        policy: Arc<dyn ReciprocityPolicy>,
        peer_block_request_filter: Option<Arc<dyn PeerBlockRequestFilter>>,
    ) -> Self {
        Engine {
            peer_task_queue: PeerTaskQueue::new(
                TaskMerger::default(),
                config.max_outstanding_bytes_per_peer,
            ),
            blockstore_manager: BlockstoreManager::new(store),
            ledger_map: Default::default(),
            peer_ledger: Default::default(),
            policy,
            target_message_size: config.target_message_size,
            max_block_size_replace_has_with_block: config.max_replace_size,
            send_dont_haves: config.send_dont_haves,
            ledger_retention: config.ledger_retention,
            peer_block_request_filter,
        }
    }

    /// Returns the aggregated data communication for the given peer.
    ///
    /// Peers we never exchanged anything with get an empty receipt.
    pub async fn ledger_for_peer(&self, peer: &PeerId) -> Receipt {
        let Some(l) = self.find(peer).await else {
            return Receipt::empty(*peer);
        };
        let ledger = l.lock().await;
        ledger.score().receipt(*peer, &*self.policy)
    }

    pub async fn debt_ratio(&self, peer: &PeerId) -> f64 {
        self.ledger_for_peer(peer).await.value
    }

    /// Returns a list of peers with whom the local node is connected.
    pub async fn peers(&self) -> Vec<PeerId> {
        let ledgers: Vec<_> = self.ledger_map.read().await.values().cloned().collect();
        let mut peers = Vec::with_capacity(ledgers.len());
        for ledger in ledgers {
            let ledger = ledger.lock().await;
            if ledger.is_connected() {
                peers.push(*ledger.partner());
            }
        }
        peers
    }

    /// The entries the peer told us it wants, highest priority first.
    pub async fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<WantlistEntry> {
        let Some(l) = self.find(peer).await else {
            return Vec::new();
        };
        let mut ledger = l.lock().await;
        ledger.entries().collect()
    }

    /// The pending obligations towards `peer`, in the order they will be served.
    pub async fn obligations_for_peer(&self, peer: &PeerId) -> Vec<Obligation> {
        self.peer_task_queue
            .pending_tasks(peer)
            .await
            .iter()
            .map(|task| Obligation::from_task(*peer, task))
            .collect()
    }

    /// Called when a message is received from a remote peer.
    /// For each item in the wantlist, add a want-have or want-block entry to the
    /// request queue (this is later popped off by the task workers).
    pub async fn message_received(&self, peer: &PeerId, message: &BitswapMessage) {
        if message.is_empty() {
            info!("received empty message from {}", peer);
        }

        let entries = last_entry_per_cid(message.wantlist());
        let (wants, cancels, denials) = self.split_wants(peer, entries);
        inc_by!(Metrics, wants_received, wants.len() as u64);
        inc_by!(Metrics, cancels_received, cancels.len() as u64);

        // get block sizes
        let want_ks: Vec<_> = wants.iter().map(|entry| entry.cid).collect();
        let block_sizes = match self.blockstore_manager.get_block_sizes(&want_ks).await {
            Ok(s) => s,
            Err(err) => {
                warn!("failed to fetch block sizes: {:?}", err);
                return;
            }
        };

        // record the wants before they show up in the ledger, so that a block
        // arriving in between finds the peer
        {
            let peer_ledger = &mut *self.peer_ledger.lock().await;
            for want in &wants {
                peer_ledger.wants(*peer, want.cid);
            }
        }

        // get the ledger for the peer
        let mut ledger = self.lock_or_create(peer).await;
        if !ledger.is_connected() {
            debug!("ignoring wants from disconnected peer {}", peer);
            drop(ledger);
            self.forget_wants(peer, want_ks.iter()).await;
            return;
        }

        let mut removed = Vec::new();

        // if the peer sent a full wantlist, clear the existing wantlist.
        if message.full() {
            let new_wants: AHashSet<_> = want_ks.iter().collect();
            for cid in ledger.clear_wantlist() {
                if !new_wants.contains(&cid) {
                    self.peer_task_queue.remove(&cid, *peer).await;
                    removed.push(cid);
                }
            }
        }

        for entry in &cancels {
            if ledger.cancel_want(&entry.cid).is_some() {
                self.peer_task_queue.remove(&entry.cid, *peer).await;
            }
            removed.push(entry.cid);
        }

        let mut active_entries = Vec::new();

        // deny access to blocks
        for entry in &denials {
            if let Some(task) = self.dont_have_task(entry) {
                active_entries.push(task);
            }
        }

        // for each want-have/want-block
        for entry in &wants {
            let cid = entry.cid;

            // add each want-have/want-block to the ledger
            ledger.wants(cid, entry.priority, entry.want_type);

            if let Some(block_size) = block_sizes.get(&cid) {
                // the block was found
                active_entries.push(self.block_task(
                    cid,
                    entry.priority,
                    entry.want_type,
                    entry.send_dont_have,
                    *block_size,
                ));
            } else if let Some(task) = self.dont_have_task(entry) {
                // the block was not found
                active_entries.push(task);
            }
        }

        if !active_entries.is_empty() {
            self.peer_task_queue.push_tasks(*peer, active_entries).await;
        }
        drop(ledger);

        self.forget_wants(peer, removed.iter()).await;
    }

    /// Called when new blocks are available, either received from a peer or added locally.
    /// Queues the blocks for every peer that wants them.
    pub async fn notify_new_blocks(&self, blocks: &[Block]) {
        if blocks.is_empty() {
            return;
        }

        // collect the interested peers first, the reverse index is never held
        // together with a ledger
        let interested: Vec<_> = {
            let peer_ledger = self.peer_ledger.lock().await;
            blocks
                .iter()
                .map(|block| (block, peer_ledger.peers(&block.cid)))
                .collect()
        };

        for (block, peers) in interested {
            for peer in peers {
                let Some(l) = self.find(&peer).await else {
                    continue;
                };
                let ledger = l.lock().await;
                if !ledger.is_connected() {
                    continue;
                }
                let Some(entry) = ledger.wantlist_get(&block.cid) else {
                    continue;
                };
                let task = self.block_task(
                    block.cid,
                    entry.priority,
                    entry.want_type,
                    false,
                    block.len(),
                );
                self.peer_task_queue.push_tasks(peer, vec![task]).await;
            }
        }
    }

    /// Builds the next message to send, waiting until there is work.
    ///
    /// Returns `Ok(None)` once `cancel` fires.
    pub async fn next_envelope(&self, cancel: &CancellationToken) -> Result<Option<Envelope>> {
        loop {
            // pop some tasks off the request queue
            let Some((peer, next_tasks, pending_bytes)) = self
                .peer_task_queue
                .next_tasks(self.target_message_size, cancel)
                .await
            else {
                return Ok(None);
            };

            // drop anything the peer cancelled while the tasks were queued
            let (next_tasks, stale_tasks) = self.split_stale(&peer, next_tasks).await;
            if !stale_tasks.is_empty() {
                self.peer_task_queue.tasks_done(peer, &stale_tasks).await;
            }

            // create a new message
            let mut msg = BitswapMessage::new(false);
            msg.set_pending_bytes(i32::try_from(pending_bytes).unwrap_or(i32::MAX));

            // split out want-blocks, want-have and DONT_HAVEs
            let mut block_cids = Vec::new();
            let mut block_tasks = Vec::new();

            for task in &next_tasks {
                if task.data.have_block {
                    if task.data.is_want_block {
                        block_cids.push(task.topic);
                        block_tasks.push(task);
                    } else {
                        // add HAVEs to the message
                        msg.add_have(task.topic);
                    }
                } else {
                    // add DONT_HAVEs to the message
                    msg.add_dont_have(task.topic);
                }
            }

            // Fetch blocks from the store
            let mut blocks = match self.blockstore_manager.get_blocks(&block_cids).await {
                Ok(blocks) => blocks,
                Err(err) => {
                    self.peer_task_queue.tasks_done(peer, &next_tasks).await;
                    return Err(err.context("failed to load blocks"));
                }
            };

            for task in block_tasks {
                if let Some(block) = blocks.remove(&task.topic) {
                    msg.add_block(block);
                } else if task.data.send_dont_have {
                    // block was not found
                    msg.add_dont_have(task.topic);
                }
            }

            // nothing to see here
            if msg.is_empty() {
                self.peer_task_queue.tasks_done(peer, &next_tasks).await;
                continue;
            }

            return Ok(Some(Envelope {
                peer,
                message: msg,
                sent_tasks: next_tasks,
            }));
        }
    }

    /// Called after an envelope was handed to the transport successfully.
    pub async fn message_sent(&self, envelope: &Envelope) {
        let peer = envelope.peer;
        let mut removed = Vec::new();

        if let Some(l) = self.find(&peer).await {
            let mut ledger = l.lock().await;

            // remove sent blocks from the want list for the peer
            for block in envelope.message.blocks() {
                ledger.score_mut().add_to_sent_bytes(block.len());
                ledger.clear_send_failure(&block.cid);
                if ledger
                    .wantlist_mut()
                    .remove_type(&block.cid, WantType::Block)
                    .is_some()
                {
                    removed.push(block.cid);
                }
            }

            // remove sent block presences from the wantlist for the peer
            for bp in envelope.message.block_presences() {
                ledger.clear_send_failure(&bp.cid);
                // don't record sent data, we reserve that for data blocks
                if bp.typ == BlockPresenceType::Have
                    && ledger
                        .wantlist_mut()
                        .remove_type(&bp.cid, WantType::Have)
                        .is_some()
                {
                    removed.push(bp.cid);
                }
            }

            self.update_score(&ledger).await;
        }

        self.peer_task_queue
            .tasks_done(peer, &envelope.sent_tasks)
            .await;
        self.forget_wants(&peer, removed.iter()).await;
    }

    /// Called when the transport failed to deliver an envelope.
    ///
    /// Tasks that failed fewer than `retry_budget` times are returned to the queue at their
    /// original priority, the others are dropped along with the peer's want and returned.
    pub async fn envelope_failed(&self, envelope: Envelope, retry_budget: u32) -> Vec<Obligation> {
        let Envelope {
            peer, sent_tasks, ..
        } = envelope;

        let Some(l) = self.find(&peer).await else {
            self.peer_task_queue.tasks_done(peer, &sent_tasks).await;
            inc_by!(Metrics, obligations_dropped, sent_tasks.len() as u64);
            return sent_tasks
                .iter()
                .map(|task| Obligation::from_task(peer, task))
                .collect();
        };

        let mut retry = Vec::new();
        let mut dropped = Vec::new();
        {
            let mut ledger = l.lock().await;
            for task in sent_tasks {
                let attempts = ledger.record_send_failure(task.topic);
                if attempts < retry_budget && ledger.is_connected() {
                    retry.push(task);
                } else {
                    ledger.cancel_want(&task.topic);
                    dropped.push(task);
                }
            }

            if !dropped.is_empty() {
                self.peer_task_queue.tasks_done(peer, &dropped).await;
            }
            if !retry.is_empty() {
                self.peer_task_queue.requeue(peer, retry.clone()).await;
            }
        }

        inc_by!(Metrics, obligations_requeued, retry.len() as u64);
        inc_by!(Metrics, obligations_dropped, dropped.len() as u64);
        self.forget_wants(&peer, dropped.iter().map(|task| &task.topic))
            .await;

        dropped
            .iter()
            .map(|task| Obligation::from_task(peer, task))
            .collect()
    }

    /// Accounts a confirmed transmission of `len` bytes to `peer`.
    pub async fn record_sent(&self, peer: &PeerId, cid: &Cid, len: usize) {
        let mut ledger = self.lock_or_create(peer).await;
        ledger.score_mut().add_to_sent_bytes(len);
        debug!("sent {} ({} bytes) to {}", cid, len, peer);
        self.update_score(&ledger).await;
    }

    /// Accounts `len` bytes received from `peer`.
    pub async fn record_received(&self, peer: &PeerId, cid: &Cid, len: usize, was_wanted: bool) {
        let mut ledger = self.lock_or_create(peer).await;
        ledger.score_mut().add_to_recv_bytes(len, was_wanted);
        debug!("received {} ({} bytes) from {}", cid, len, peer);
        self.update_score(&ledger).await;
    }

    /// Called when a new peer connects, which means we will start sending blocks to this peer.
    pub async fn peer_connected(&self, peer: &PeerId) {
        let mut ledger = self.lock_or_create(peer).await;
        ledger.set_connected();
        self.update_score(&ledger).await;
    }

    /// Called when a peer is disconnected.
    ///
    /// The counters stay around for the retention window, everything the peer wanted is dropped.
    pub async fn peer_disconnected(&self, peer: &PeerId) {
        let Some(l) = self.find(peer).await else {
            return;
        };
        let cids = {
            let mut ledger = l.lock().await;
            ledger.set_disconnected(Instant::now());
            let cids = ledger.clear_wantlist();
            self.peer_task_queue.remove_peer(peer).await;
            cids
        };

        self.forget_wants(peer, cids.iter()).await;
    }

    /// Releases the ledgers of peers that have been disconnected for longer than the
    /// retention window. Returns the number of released ledgers.
    pub async fn sweep_ledgers(&self, now: Instant) -> usize {
        let mut released = Vec::new();
        {
            let ledger_map = &mut *self.ledger_map.write().await;
            ledger_map.retain(|peer, l| match l.try_lock() {
                Ok(mut ledger) if ledger.is_expired(now, self.ledger_retention) => {
                    ledger.release();
                    released.push(*peer);
                    false
                }
                Ok(_) => true,
                // in use, so not expired
                Err(_) => true,
            });
        }

        for peer in &released {
            self.peer_task_queue.remove_peer(peer).await;
        }
        if !released.is_empty() {
            debug!("released {} ledgers", released.len());
            inc_by!(Metrics, ledgers_swept, released.len() as u64);
        }
        released.len()
    }

    fn split_wants<'a>(
        &self,
        peer: &PeerId,
        entries: Vec<&'a Entry>,
    ) -> (Vec<&'a Entry>, Vec<&'a Entry>, Vec<&'a Entry>) {
        let mut wants = Vec::new();
        let mut cancels = Vec::new();
        let mut denials = Vec::new();

        for entry in entries {
            if entry.cancel {
                cancels.push(entry);
            } else if let Some(ref filter) = self.peer_block_request_filter {
                if (filter)(peer, &entry.cid) {
                    wants.push(entry);
                } else {
                    denials.push(entry);
                }
            } else {
                wants.push(entry);
            }
        }

        (wants, cancels, denials)
    }

    /// Splits tasks into the ones the peer still wants and the ones it does not.
    /// Denials never make it onto the wantlist, so DONT_HAVEs are always kept.
    async fn split_stale(
        &self,
        peer: &PeerId,
        tasks: Vec<Task<Cid, TaskData>>,
    ) -> (Vec<Task<Cid, TaskData>>, Vec<Task<Cid, TaskData>>) {
        let Some(l) = self.find(peer).await else {
            return (Vec::new(), tasks);
        };
        let ledger = l.lock().await;
        tasks
            .into_iter()
            .partition(|task| !task.data.have_block || ledger.wantlist_get(&task.topic).is_some())
    }

    fn block_task(
        &self,
        cid: Cid,
        priority: Priority,
        want_type: WantType,
        send_dont_have: bool,
        block_size: usize,
    ) -> Task<Cid, TaskData> {
        let is_want_block = self.send_as_block(want_type, block_size);
        let entry_size = if is_want_block {
            block_size
        } else {
            BlockPresence::encoded_len_for_cid(cid)
        };

        Task {
            topic: cid,
            priority: priority as isize,
            work: entry_size,
            data: TaskData {
                is_want_block,
                send_dont_have,
                block_size,
                have_block: true,
            },
        }
    }

    fn dont_have_task(&self, entry: &Entry) -> Option<Task<Cid, TaskData>> {
        // only add the task to the queue if the requester wants DONT_HAVE
        if !(self.send_dont_haves && entry.send_dont_have) {
            return None;
        }
        Some(Task {
            topic: entry.cid,
            priority: entry.priority as isize,
            work: BlockPresence::encoded_len_for_cid(entry.cid),
            data: TaskData {
                block_size: 0,
                have_block: false,
                is_want_block: entry.want_type == WantType::Block,
                send_dont_have: entry.send_dont_have,
            },
        })
    }

    fn send_as_block(&self, want_type: WantType, block_size: usize) -> bool {
        let is_want_block = want_type == WantType::Block;
        is_want_block || block_size <= self.max_block_size_replace_has_with_block
    }

    async fn update_score(&self, ledger: &Ledger) {
        let receipt = ledger.score().receipt(*ledger.partner(), &*self.policy);
        let score = PeerScore {
            debt_ratio: receipt.value,
            overdrawn: self.policy.is_overdrawn(receipt.value),
        };
        self.peer_task_queue
            .update_score(*ledger.partner(), score)
            .await;
    }

    /// Removes the peer from the reverse index of the given keys.
    async fn forget_wants<'a>(&self, peer: &PeerId, cids: impl Iterator<Item = &'a Cid>) {
        let peer_ledger = &mut *self.peer_ledger.lock().await;
        for cid in cids {
            peer_ledger.cancel_want(peer, cid);
        }
    }

    async fn find(&self, peer: &PeerId) -> Option<Arc<Mutex<Ledger>>> {
        self.ledger_map.read().await.get(peer).cloned()
    }

    async fn find_or_create(&self, peer: &PeerId) -> Arc<Mutex<Ledger>> {
        if let Some(ledger) = self.find(peer).await {
            return ledger;
        }
        self.ledger_map
            .write()
            .await
            .entry(*peer)
            .or_insert_with(|| Arc::new(Mutex::new(Ledger::new(*peer))))
            .clone()
    }

    /// Locks the ledger of `peer`, creating it if needed.
    ///
    /// A ledger released by the sweep between lookup and lock is skipped, so no update
    /// lands on a ledger that is no longer in the map.
    async fn lock_or_create(&self, peer: &PeerId) -> OwnedMutexGuard<Ledger> {
        loop {
            let ledger = self.find_or_create(peer).await.lock_owned().await;
            if !ledger.is_released() {
                return ledger;
            }
        }
    }
}

/// Keeps only the last entry for each cid, in message order.
fn last_entry_per_cid<'a>(entries: impl Iterator<Item = &'a Entry>) -> Vec<&'a Entry> {
    let entries: Vec<_> = entries.collect();
    let last: AHashMap<Cid, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| (entry.cid, i))
        .collect();
    entries
        .into_iter()
        .enumerate()
        .filter(|(i, entry)| last.get(&entry.cid) == Some(i))
        .map(|(_, entry)| entry)
        .collect()
}

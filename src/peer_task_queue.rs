//! Based on https://github.com/ipfs/go-peertaskqueue.
//!
//! Tasks are grouped per peer. Peers are ordered by a [`PeerPriority`] that is
//! recomputed for the affected peer only, whenever its tasks or its score change.

use std::{cmp::Ordering, fmt::Debug, hash::Hash, sync::Arc};

use ahash::AHashMap;
use keyed_priority_queue::KeyedPriorityQueue;
use libp2p::PeerId;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::trace;

mod peer_task;
mod peer_tracker;

pub use self::peer_task::{DefaultTaskMerger, Task, TaskMerger};
use self::peer_tracker::PeerTracker;

pub trait Topic:
    Sized + Debug + PartialEq + Clone + Eq + PartialOrd + Ord + Hash + Send + Sync + 'static
{
}
impl<T: Sized + Debug + PartialEq + Clone + Eq + PartialOrd + Ord + Hash + Send + Sync + 'static>
    Topic for T
{
}

pub trait Data: Sized + Debug + Clone + PartialEq + Eq + Send + Sync + 'static {}
impl<T: Sized + Debug + Clone + PartialEq + Eq + Send + Sync + 'static> Data for T {}

/// How the decision engine currently rates a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeerScore {
    pub debt_ratio: f64,
    /// Set when the peer took much more than it gave back.
    pub overdrawn: bool,
}

/// The position of a peer in the scheduling order, greater is served first.
#[derive(Debug, Clone, Copy)]
struct PeerPriority {
    ready: bool,
    score: PeerScore,
    active_work: usize,
    last_served: u64,
}

impl PartialEq for PeerPriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PeerPriority {}

impl PartialOrd for PeerPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        // peers without anything to do come last
        self.ready
            .cmp(&other.ready)
            // then peers in good standing before overdrawn ones
            .then_with(|| other.score.overdrawn.cmp(&self.score.overdrawn))
            // lower debt ratio first
            .then_with(|| other.score.debt_ratio.total_cmp(&self.score.debt_ratio))
            // keep peers busy, least amount of work in flight first
            .then_with(|| other.active_work.cmp(&self.active_work))
            // least recently served first
            .then_with(|| other.last_served.cmp(&self.last_served))
    }
}

/// A prioritized list of tasks to be executed on peers.
#[derive(Debug)]
pub struct PeerTaskQueue<T: Topic, D: Data, TM: TaskMerger<T, D>> {
    inner: Arc<Inner<T, D, TM>>,
}

impl<T: Topic, D: Data, TM: TaskMerger<T, D>> Clone for PeerTaskQueue<T, D, TM> {
    fn clone(&self) -> Self {
        PeerTaskQueue {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<T: Topic, D: Data, TM: TaskMerger<T, D>> {
    state: Mutex<QueueState<T, D, TM>>,
    work_available: Notify,
    task_merger: TM,
    max_active_work_per_peer: usize,
}

#[derive(Debug)]
struct QueueState<T: Topic, D: Data, TM: TaskMerger<T, D>> {
    peer_trackers: AHashMap<PeerId, PeerTracker<T, D, TM>>,
    peer_queue: KeyedPriorityQueue<PeerId, PeerPriority>,
    scores: AHashMap<PeerId, PeerScore>,
    round: u64,
}

impl<T: Topic, D: Data, TM: TaskMerger<T, D>> QueueState<T, D, TM> {
    /// Moves the peer to its current place in the peer queue, or drops it when idle.
    fn reposition(&mut self, peer: &PeerId) {
        let Some(tracker) = self.peer_trackers.get(peer) else {
            self.peer_queue.remove(peer);
            return;
        };
        if tracker.is_idle() {
            self.peer_trackers.remove(peer);
            self.peer_queue.remove(peer);
            return;
        }

        let priority = PeerPriority {
            ready: tracker.is_ready(),
            score: self.scores.get(peer).copied().unwrap_or_default(),
            active_work: tracker.active_work(),
            last_served: tracker.last_served(),
        };
        self.peer_queue.push(*peer, priority);
    }

    fn has_ready_peer(&self) -> bool {
        self.peer_queue
            .peek()
            .map(|(_, prio)| prio.ready)
            .unwrap_or_default()
    }
}

impl<T: Topic, D: Data, TM: TaskMerger<T, D>> PeerTaskQueue<T, D, TM> {
    /// Creates a new queue.
    ///
    /// `max_active_work_per_peer` caps the in-flight work per peer, 0 disables the cap.
    pub fn new(task_merger: TM, max_active_work_per_peer: usize) -> Self {
        PeerTaskQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    peer_trackers: Default::default(),
                    peer_queue: Default::default(),
                    scores: Default::default(),
                    round: 0,
                }),
                work_available: Notify::new(),
                task_merger,
                max_active_work_per_peer,
            }),
        }
    }

    /// Adds a new group of tasks for the given peer to the queue.
    pub async fn push_tasks(&self, peer: PeerId, tasks: Vec<Task<T, D>>) {
        if tasks.is_empty() {
            return;
        }
        let state = &mut *self.inner.state.lock().await;
        let tracker = state.peer_trackers.entry(peer).or_insert_with(|| {
            PeerTracker::new(
                peer,
                self.inner.task_merger.clone(),
                self.inner.max_active_work_per_peer,
            )
        });
        tracker.push_tasks(tasks);
        state.reposition(&peer);

        if state.has_ready_peer() {
            self.inner.work_available.notify_one();
        }
    }

    /// Finds the peer with the highest priority and pops as many tasks off the peer's queue as
    /// necessary to cover `target_min_work` bytes.
    ///
    /// Returns the peer, the tasks and the remaining pending work for that peer, or `None`
    /// if no peer has work ready. A ready peer always yields at least one task.
    pub async fn pop_tasks(&self, target_min_work: usize) -> Option<(PeerId, Vec<Task<T, D>>, usize)> {
        let target_min_work = target_min_work.max(1);
        let state = &mut *self.inner.state.lock().await;

        let peer = match state.peer_queue.peek() {
            Some((peer, prio)) if prio.ready => *peer,
            _ => return None,
        };

        state.round += 1;
        let round = state.round;
        let tracker = state.peer_trackers.get_mut(&peer)?;
        let tasks = tracker.pop_tasks(target_min_work);
        tracker.set_last_served(round);
        let pending_work = tracker.get_pending_work();
        state.reposition(&peer);

        // hand the rest of the work to the next waiting worker
        if state.has_ready_peer() {
            self.inner.work_available.notify_one();
        }

        if tasks.is_empty() {
            return None;
        }
        trace!("popped {} tasks for {}", tasks.len(), peer);
        Some((peer, tasks, pending_work))
    }

    /// Like [`PeerTaskQueue::pop_tasks`], but waits for work to arrive.
    ///
    /// Returns `None` once `cancel` fires.
    pub async fn next_tasks(
        &self,
        target_min_work: usize,
        cancel: &CancellationToken,
    ) -> Option<(PeerId, Vec<Task<T, D>>, usize)> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let notified = self.inner.work_available.notified();
            if let Some(res) = self.pop_tasks(target_min_work).await {
                return Some(res);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    /// Is called to indicate that the given tasks have been processed.
    pub async fn tasks_done(&self, peer: PeerId, tasks: &[Task<T, D>]) {
        let state = &mut *self.inner.state.lock().await;
        let Some(tracker) = state.peer_trackers.get_mut(&peer) else {
            return;
        };
        for task in tasks {
            tracker.task_done(task);
        }
        state.reposition(&peer);

        // the peer might have dropped below its work limit
        if state.has_ready_peer() {
            self.inner.work_available.notify_one();
        }
    }

    /// Returns in-flight tasks to the pending queue, keeping their priority.
    pub async fn requeue(&self, peer: PeerId, tasks: Vec<Task<T, D>>) {
        let state = &mut *self.inner.state.lock().await;
        let Some(tracker) = state.peer_trackers.get_mut(&peer) else {
            // the peer went away in the meantime
            return;
        };
        for task in &tasks {
            tracker.task_done(task);
        }
        tracker.push_tasks(tasks);
        state.reposition(&peer);

        if state.has_ready_peer() {
            self.inner.work_available.notify_one();
        }
    }

    /// Removes a pending task from the queue.
    pub async fn remove(&self, topic: &T, peer: PeerId) {
        let state = &mut *self.inner.state.lock().await;
        if let Some(tracker) = state.peer_trackers.get_mut(&peer) {
            if tracker.remove(topic) {
                state.reposition(&peer);
            }
        }
    }

    /// Forgets all tasks and the score of a peer.
    pub async fn remove_peer(&self, peer: &PeerId) {
        let state = &mut *self.inner.state.lock().await;
        state.peer_trackers.remove(peer);
        state.peer_queue.remove(peer);
        state.scores.remove(peer);
    }

    /// Updates the score of a peer, re-ordering it if it has work queued.
    pub async fn update_score(&self, peer: PeerId, score: PeerScore) {
        let state = &mut *self.inner.state.lock().await;
        state.scores.insert(peer, score);
        if state.peer_trackers.contains_key(&peer) {
            state.reposition(&peer);
        }
    }

    /// The score the peer is currently ordered by, if one was set.
    pub async fn score(&self, peer: &PeerId) -> Option<PeerScore> {
        self.inner.state.lock().await.scores.get(peer).copied()
    }

    /// The pending tasks for the given peer, in the order they will be served.
    pub async fn pending_tasks(&self, peer: &PeerId) -> Vec<Task<T, D>> {
        let state = &*self.inner.state.lock().await;
        state
            .peer_trackers
            .get(peer)
            .map(|tracker| tracker.pending_tasks())
            .unwrap_or_default()
    }

    /// Peers that currently have pending or active tasks.
    pub async fn peers(&self) -> Vec<PeerId> {
        let state = &*self.inner.state.lock().await;
        state.peer_trackers.keys().copied().collect()
    }
}

use std::cmp::Ordering;

use libp2p::PeerId;

use super::{Data, Topic};

/// A single unit of work for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task<T: Topic, D: Data> {
    /// The key of the task, eg the cid of the block.
    pub topic: T,
    /// Priority of the task, higher is served first.
    pub priority: isize,
    /// The size of the task, eg the number of bytes in a block.
    pub work: usize,
    /// Application specific data.
    pub data: D,
}

/// Decides how tasks with the same topic are combined.
pub trait TaskMerger<T: Topic, D: Data>:
    std::fmt::Debug + Clone + PartialEq + Eq + Send + Sync + 'static
{
    /// Indicates whether the given task has more information than the existing group of tasks
    /// (which have the same topic), and thus should be queued again.
    fn has_new_info(&self, task_info: &Task<T, D>, existing_tasks: &[Task<T, D>]) -> bool;

    /// Copies relevant fields from a new task to an existing one.
    fn merge(&self, task: &Task<T, D>, existing: &mut Task<T, D>);
}

/// Never replaces an in-flight task and keeps pending tasks as they are.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DefaultTaskMerger {}

impl<T: Topic, D: Data> TaskMerger<T, D> for DefaultTaskMerger {
    fn has_new_info(&self, _task_info: &Task<T, D>, _existing_tasks: &[Task<T, D>]) -> bool {
        false
    }

    fn merge(&self, _task: &Task<T, D>, _existing: &mut Task<T, D>) {}
}

/// A task waiting in a peer's queue.
#[derive(Debug, Clone)]
pub struct QueueTask<T: Topic, D: Data> {
    pub task: Task<T, D>,
    pub target: PeerId,
    /// Arrival order within the peer, lower is older.
    pub seq: u64,
}

impl<T: Topic, D: Data> QueueTask<T, D> {
    pub fn new(task: Task<T, D>, target: PeerId, seq: u64) -> Self {
        QueueTask { task, target, seq }
    }
}

impl<T: Topic, D: Data> PartialEq for QueueTask<T, D> {
    fn eq(&self, other: &Self) -> bool {
        self.task == other.task && self.target == other.target && self.seq == other.seq
    }
}

impl<T: Topic, D: Data> Eq for QueueTask<T, D> {}

impl<T: Topic, D: Data> PartialOrd for QueueTask<T, D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Topic, D: Data> Ord for QueueTask<T, D> {
    /// Higher priority first, then first in first out.
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

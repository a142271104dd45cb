use ahash::AHashMap;
use keyed_priority_queue::KeyedPriorityQueue;
use libp2p::PeerId;

use super::{peer_task::QueueTask, Data, Task, TaskMerger, Topic};

/// Tracks task blocks for a single peer, as well as its active tasks.
#[derive(Debug)]
pub struct PeerTracker<T: Topic, D: Data, TM: TaskMerger<T, D>> {
    target: PeerId,
    /// Priority queue of tasks belonging to this peer, stores the pending tasks.
    pending_tasks: KeyedPriorityQueue<T, QueueTask<T, D>>,
    active_tasks: AHashMap<T, Vec<Task<T, D>>>,
    active_work: usize,
    max_active_work_per_peer: usize,
    next_seq: u64,
    /// The scheduling round this peer was last served in.
    last_served: u64,
    task_merger: TM,
}

impl<T: Topic, D: Data, TM: TaskMerger<T, D>> PeerTracker<T, D, TM> {
    pub fn new(target: PeerId, task_merger: TM, max_active_work_per_peer: usize) -> Self {
        PeerTracker {
            target,
            pending_tasks: Default::default(),
            active_tasks: Default::default(),
            active_work: 0,
            max_active_work_per_peer,
            next_seq: 0,
            last_served: 0,
            task_merger,
        }
    }

    /// Returns true if the peer has no active or queue tasks.
    pub fn is_idle(&self) -> bool {
        self.pending_tasks.is_empty() && self.active_tasks.is_empty()
    }

    /// Returns true if the peer has pending tasks and room for more active work.
    pub fn is_ready(&self) -> bool {
        !self.pending_tasks.is_empty() && !self.is_saturated()
    }

    fn is_saturated(&self) -> bool {
        self.max_active_work_per_peer > 0 && self.active_work >= self.max_active_work_per_peer
    }

    pub fn active_work(&self) -> usize {
        self.active_work
    }

    pub fn last_served(&self) -> u64 {
        self.last_served
    }

    pub fn set_last_served(&mut self, round: u64) {
        self.last_served = round;
    }

    #[cfg(test)]
    pub fn topics(&self) -> Topics<T> {
        let mut pending: Vec<_> = self
            .pending_tasks
            .iter()
            .map(|(_, qt)| qt.task.topic.clone())
            .collect();
        pending.sort();
        let mut active: Vec<_> = self
            .active_tasks
            .values()
            .flat_map(|t| t.iter().map(|t| t.topic.clone()))
            .collect();
        active.sort();
        Topics { pending, active }
    }

    /// The pending tasks in the order they would be popped.
    pub fn pending_tasks(&self) -> Vec<Task<T, D>> {
        let mut pending: Vec<_> = self.pending_tasks.iter().map(|(_, qt)| qt).collect();
        pending.sort_by(|a, b| b.cmp(a));
        pending.into_iter().map(|qt| qt.task.clone()).collect()
    }

    pub fn push_tasks(&mut self, tasks: Vec<Task<T, D>>) {
        for task in tasks {
            // If the new task doesn't add any more information over what we already
            // have in the active queue, then skip it.
            if !self.task_has_more_info_than_active_tasks(&task) {
                continue;
            }

            // if there is already a non-active task with this topic
            if let Some(mut existing_task) = self.pending_tasks.remove(&task.topic) {
                // if the task has a higher priority than the old task
                if task.priority > existing_task.task.priority {
                    // update priority
                    existing_task.task.priority = task.priority;
                }
                self.task_merger.merge(&task, &mut existing_task.task);
                self.pending_tasks
                    .push(existing_task.task.topic.clone(), existing_task);

                // A task with the topic exists, so no need to add a new task
                // to the queue.
                continue;
            }

            let seq = self.next_seq;
            self.next_seq += 1;
            let topic = task.topic.clone();
            let qtask = QueueTask::new(task, self.target, seq);
            self.pending_tasks.push(topic, qtask);
        }
    }

    /// Pops off as many tasks as necessary to cover `target_min_work`, in priority order.
    /// If there are not enough tasks to cover `target_min_work`, it just returns everything
    /// available.
    pub fn pop_tasks(&mut self, target_min_work: usize) -> Vec<Task<T, D>> {
        let mut out = Vec::new();
        let mut work = 0;

        while work < target_min_work {
            // do not add work to a peer that is already maxed out
            if self.is_saturated() {
                break;
            }

            // pop the next task off the queue
            let Some((_, qtask)) = self.pending_tasks.pop() else {
                break;
            };
            let task = qtask.task;
            self.start_task(task.clone());
            work += task.work;
            out.push(task);
        }

        out
    }

    fn start_task(&mut self, task: Task<T, D>) {
        // Add task to active queue
        self.active_work += task.work;
        self.active_tasks
            .entry(task.topic.clone())
            .or_default()
            .push(task);
    }

    pub fn get_pending_work(&self) -> usize {
        self.pending_tasks.iter().map(|(_, qt)| qt.task.work).sum()
    }

    /// Signals that the given task was completed for this peer.
    pub fn task_done(&mut self, task: &Task<T, D>) {
        // remove tasks from active tasks
        if let Some(active_tasks) = self.active_tasks.get_mut(&task.topic) {
            let mut work_done = 0;
            active_tasks.retain(|at| {
                if at == task {
                    work_done += task.work;
                    false
                } else {
                    true
                }
            });

            self.active_work = self.active_work.saturating_sub(work_done);

            if active_tasks.is_empty() {
                self.active_tasks.remove(&task.topic);
            }
        }
    }

    /// Removes the pending task for `topic`. Active tasks are left to finish.
    pub fn remove(&mut self, topic: &T) -> bool {
        self.pending_tasks.remove(topic).is_some()
    }

    fn task_has_more_info_than_active_tasks(&self, task: &Task<T, D>) -> bool {
        if let Some(tasks_with_topic) = self.active_tasks.get(&task.topic) {
            if tasks_with_topic.is_empty() {
                return true;
            }
            return self.task_merger.has_new_info(task, tasks_with_topic);
        }

        true
    }
}

#[cfg(test)]
#[derive(Debug)]
pub struct Topics<T: Topic> {
    pub pending: Vec<T>,
    pub active: Vec<T>,
}

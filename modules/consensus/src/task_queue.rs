//! Ordered task queue feeding the scheduler's drain loop.
//!
//! Two lanes: the reorg lane holds a whole reorg plan and always drains
//! before routine traffic, so nothing enqueued after a plan (not even at
//! the front) can run between its steps. While a reorg bracket is open
//! the queue is paused and only the reorg lane is served.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::task::{Priority, Task};

#[derive(Default)]
struct QueueState {
    reorg_lane: VecDeque<Task>,
    tasks: VecDeque<Task>,
    /// Routine lane held while a reorg bracket is open
    paused: bool,
    terminated: bool,
    /// A sync is queued or running
    sync_scheduled: bool,
    /// A fork-choice check is queued or running
    reorg_check_scheduled: bool,
    /// A reorg plan is queued or executing
    reorg_pending: bool,
}

#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The state is plain data, a panic elsewhere cannot leave it torn
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a routine task. Returns false if it was dropped as a duplicate
    /// or because the queue is terminated.
    pub fn push(&self, task: Task, priority: Priority) -> bool {
        let mut state = self.lock();
        if state.terminated {
            return false;
        }

        match task {
            Task::SyncWithPeers if state.sync_scheduled => {
                debug!("Sync already scheduled");
                return false;
            }
            Task::SyncWithPeers => state.sync_scheduled = true,
            Task::CheckReorg if state.reorg_check_scheduled || state.reorg_pending => {
                return false;
            }
            Task::CheckReorg => state.reorg_check_scheduled = true,
            _ => {}
        }

        match priority {
            Priority::Normal => state.tasks.push_back(task),
            Priority::Front => state.tasks.push_front(task),
        }
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Queue a reorg plan ahead of all routine traffic, bracketed by
    /// `ReorgStart`/`ReorgEnd`. Refused while another plan is pending.
    pub fn push_reorg_plan(&self, steps: Vec<Task>) -> bool {
        let mut state = self.lock();
        if state.terminated || state.reorg_pending {
            return false;
        }

        state.reorg_lane.push_back(Task::ReorgStart);
        state.reorg_lane.extend(steps);
        state.reorg_lane.push_back(Task::ReorgEnd);
        state.reorg_pending = true;
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Next task to run, or `None` if nothing is runnable
    pub fn pop(&self) -> Option<Task> {
        let mut state = self.lock();
        if state.terminated {
            return None;
        }
        if let Some(task) = state.reorg_lane.pop_front() {
            return Some(task);
        }
        if state.paused {
            return None;
        }
        state.tasks.pop_front()
    }

    /// Wait until something is pushed, or `idle` elapses
    pub async fn wait(&self, idle: Duration) {
        let _ = tokio::time::timeout(idle, self.notify.notified()).await;
    }

    pub fn pause(&self) {
        self.lock().paused = true;
    }

    /// Close the reorg bracket and release routine traffic
    pub fn end_reorg(&self) {
        let mut state = self.lock();
        state.reorg_pending = false;
        state.paused = false;
        drop(state);
        self.notify.notify_one();
    }

    /// Drop the remaining steps of a failed plan and close the bracket
    pub fn abort_reorg(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.reorg_lane.len();
        state.reorg_lane.clear();
        state.reorg_pending = false;
        state.paused = false;
        dropped
    }

    pub fn reorg_pending(&self) -> bool {
        self.lock().reorg_pending
    }

    pub fn sync_finished(&self) {
        self.lock().sync_scheduled = false;
    }

    pub fn reorg_check_finished(&self) {
        self.lock().reorg_check_scheduled = false;
    }

    /// Stop serving tasks and drop everything queued
    pub fn terminate(&self) {
        let mut state = self.lock();
        state.terminated = true;
        state.reorg_lane.clear();
        state.tasks.clear();
        drop(state);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    pub fn len(&self) -> usize {
        let state = self.lock();
        state.reorg_lane.len() + state.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

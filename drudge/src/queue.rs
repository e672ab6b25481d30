//! Bounded FIFO task queue.
//!
//! One mutex guards both the pending tasks and the id of the task the worker
//! has taken, so admission, removal and "is this id still pending" checks are
//! atomic with respect to each other.

use std::collections::VecDeque;
use std::sync::{Mutex as StdMutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::task::{Task, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    /// Task handed to the worker and not yet finished.
    in_flight: Option<TaskId>,
}

pub struct TaskQueue {
    state: StdMutex<QueueState>,
    available: Notify,
    capacity: Option<usize>,
}

impl TaskQueue {
    /// Create a queue holding at most `queue_size` pending tasks. `0` is unbounded.
    pub fn new(queue_size: usize) -> Self {
        Self {
            state: StdMutex::new(QueueState::default()),
            available: Notify::new(),
            capacity: (queue_size > 0).then_some(queue_size),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Task queue mutex poisoned - recovering state");
            poisoned.into_inner()
        })
    }

    /// Append a task without waiting for it to run. Fails when at capacity.
    pub fn enqueue(&self, task: Task) -> Result<TaskId, EnqueueError> {
        let id = task.id;
        {
            let mut state = self.lock();
            if let Some(capacity) = self.capacity
                && state.pending.len() >= capacity
            {
                return Err(EnqueueError::QueueFull { capacity });
            }
            state.pending.push_back(task);
            tracing::trace!(task_id = %id, queue_len = state.pending.len(), "Task enqueued");
        }
        self.available.notify_one();
        Ok(id)
    }

    /// Wait for the next task in submission order.
    ///
    /// Returns `None` once `shutdown` is cancelled, even if tasks remain queued.
    /// The returned task is recorded as in flight until [`finish`](Self::finish).
    pub async fn dequeue(&self, shutdown: &CancellationToken) -> Option<Task> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(task) = self.take_next() {
                return Some(task);
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = self.available.notified() => {}
            }
        }
    }

    fn take_next(&self) -> Option<Task> {
        let mut state = self.lock();
        let task = state.pending.pop_front()?;
        state.in_flight = Some(task.id);
        Some(task)
    }

    /// Mark the in-flight task as done. Call after its result is stored.
    pub fn finish(&self, id: TaskId) {
        let mut state = self.lock();
        if state.in_flight == Some(id) {
            state.in_flight = None;
        } else {
            tracing::warn!(task_id = %id, "Finished task was not in flight");
        }
    }

    /// Whether `id` is queued or currently executing.
    pub fn is_pending(&self, id: TaskId) -> bool {
        let state = self.lock();
        state.in_flight == Some(id) || state.pending.iter().any(|t| t.id == id)
    }

    /// Remove and return every task still waiting.
    pub fn drain(&self) -> Vec<Task> {
        self.lock().pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn in_flight(&self) -> Option<TaskId> {
        self.lock().in_flight
    }
}

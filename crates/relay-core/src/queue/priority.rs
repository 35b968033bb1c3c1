//! Priority task queue shared by all consumers and workers.

use std::collections::BinaryHeap;

use tokio::sync::{Mutex, Notify};

use crate::domain::Task;

struct QueueState<M> {
    heap: BinaryHeap<Task<M>>,

    /// Next arrival sequence number.
    next_seq: u64,
}

/// Concurrent priority buffer between ingestion and the worker pool.
///
/// - `pop` waits until a task is available (no polling).
/// - `push` waits for free space only when the queue was created bounded.
/// - Equal priorities are served in arrival order.
pub struct PriorityTaskQueue<M> {
    state: Mutex<QueueState<M>>,
    capacity: Option<usize>,
    /// Signalled when a task was added.
    ready: Notify,
    /// Signalled when a task was removed (bounded queues only wait on it).
    space: Notify,
}

impl<M: Send> PriorityTaskQueue<M> {
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            capacity,
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Add a task, stamping its arrival sequence.
    pub async fn push(&self, task: Task<M>) {
        let mut task = Some(task);
        loop {
            {
                let mut state = self.state.lock().await;
                let full = self
                    .capacity
                    .is_some_and(|capacity| state.heap.len() >= capacity);
                if !full {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    if let Some(task) = task.take() {
                        state.heap.push(task.with_seq(seq));
                    }
                    let more_space = self
                        .capacity
                        .is_none_or(|capacity| state.heap.len() < capacity);
                    drop(state);
                    self.ready.notify_one();
                    if more_space && self.capacity.is_some() {
                        // Pass the wake-up on to the next blocked producer.
                        self.space.notify_one();
                    }
                    return;
                }
            }
            self.space.notified().await;
        }
    }

    /// Take the highest priority task, waiting until one is available.
    ///
    /// Cancel safe: a task is only removed in the same poll that returns it.
    pub async fn pop(&self) -> Task<M> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(task) = state.heap.pop() {
                    let more = !state.heap.is_empty();
                    drop(state);
                    if more {
                        // Two pushes may have left a single stored permit; hand it on.
                        self.ready.notify_one();
                    }
                    self.space.notify_one();
                    return task;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Take the highest priority task if one is queued right now.
    pub async fn try_pop(&self) -> Option<Task<M>> {
        let task = self.state.lock().await.heap.pop();
        if task.is_some() {
            self.space.notify_one();
        }
        task
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

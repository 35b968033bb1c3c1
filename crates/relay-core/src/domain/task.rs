//! Task: a message tagged with the priority of the queue it came from.

use std::cmp::Ordering;

use super::message::Message;

/// Unit moved between the ingress consumers and the workers.
///
/// Ordering is by priority only (higher first). Equal priorities fall back to
/// the arrival sequence stamped by the task queue, earliest first, so the
/// order a `BinaryHeap` yields is fully deterministic.
#[derive(Debug)]
pub struct Task<M> {
    message: M,
    priority: i32,
    seq: u64,
}

impl<M: Message> Task<M> {
    pub fn new(message: M, priority: i32) -> Self {
        Self {
            message,
            priority,
            seq: 0,
        }
    }
}

impl<M> Task<M> {
    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Arrival order assigned at enqueue time.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn into_message(self) -> M {
        self.message
    }

    pub(crate) fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}

impl<M> PartialEq for Task<M> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<M> Eq for Task<M> {}

impl<M> PartialOrd for Task<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M> Ord for Task<M> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse on seq: the earlier arrival is the "greater" task.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use super::*;
    use crate::domain::DefaultMessage;

    fn task(id: &str, priority: i32, seq: u64) -> Task<DefaultMessage> {
        Task::new(DefaultMessage::new(id), priority).with_seq(seq)
    }

    #[test]
    fn higher_priority_wins() {
        assert!(task("a", 10, 5) > task("b", 1, 1));
    }

    #[test]
    fn equal_priority_prefers_earlier_arrival() {
        assert!(task("a", 3, 1) > task("b", 3, 2));
    }

    #[test]
    fn heap_yields_priority_then_arrival_order() {
        let mut heap = BinaryHeap::new();
        heap.push(task("low-1", 1, 1));
        heap.push(task("high-1", 5, 2));
        heap.push(task("low-2", 1, 3));
        heap.push(task("high-2", 5, 4));

        let order: Vec<String> = std::iter::from_fn(|| heap.pop())
            .map(|t| t.message().id().to_string())
            .collect();
        assert_eq!(order, vec!["high-1", "high-2", "low-1", "low-2"]);
    }
}

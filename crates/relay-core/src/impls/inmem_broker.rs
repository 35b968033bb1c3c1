//! InMemoryBroker - broker emulation for tests and local runs.
//!
//! Behaves like the subset of an AMQP broker the engine relies on:
//! - a queue with a consumer gets its messages pushed as deliveries
//! - a queue without a consumer stores its messages (output / failed queues)
//! - unsettled deliveries are tracked by tag until ack / reject / dead_letter
//! - dead-lettered messages come back to their queue after the TTL

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

use crate::domain::DeliveryTag;
use crate::ports::{Broker, BrokerError, Deliveries, Delivery};

/// Everything the broker did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Delivered { queue: String, tag: DeliveryTag },
    Acked { tag: DeliveryTag },
    Rejected { tag: DeliveryTag, requeue: bool },
    DeadLettered { queue: String, tag: DeliveryTag },
    Published { route: String },
}

/// Point-in-time copy of the broker state.
#[derive(Debug, Clone, Default)]
pub struct BrokerSnapshot {
    pub events: Vec<BrokerEvent>,
    pub stored: HashMap<String, Vec<Vec<u8>>>,
    pub unacked: usize,
}

impl BrokerSnapshot {
    pub fn acked(&self) -> usize {
        self.count(|e| matches!(e, BrokerEvent::Acked { .. }))
    }

    pub fn dead_lettered(&self) -> usize {
        self.count(|e| matches!(e, BrokerEvent::DeadLettered { .. }))
    }

    pub fn delivered(&self) -> usize {
        self.count(|e| matches!(e, BrokerEvent::Delivered { .. }))
    }

    pub fn stored(&self, route: &str) -> &[Vec<u8>] {
        self.stored.get(route).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn count(&self, predicate: impl Fn(&BrokerEvent) -> bool) -> usize {
        self.events.iter().filter(|e| predicate(e)).count()
    }
}

#[derive(Default)]
struct BrokerState {
    next_tag: u64,
    consumers: HashMap<String, mpsc::UnboundedSender<Delivery>>,
    stored: HashMap<String, VecDeque<Vec<u8>>>,
    unacked: HashMap<DeliveryTag, (String, Vec<u8>)>,
    events: Vec<BrokerEvent>,
}

impl BrokerState {
    /// Hand `body` to the queue's consumer, or store it if there is none.
    fn route(&mut self, queue: &str, body: Vec<u8>) {
        let Some(consumer) = self.consumers.get(queue) else {
            self.stored
                .entry(queue.to_string())
                .or_default()
                .push_back(body);
            return;
        };

        self.next_tag += 1;
        let tag = DeliveryTag::new(self.next_tag);
        let delivery = Delivery {
            tag,
            body: body.clone(),
        };
        if consumer.send(delivery).is_err() {
            // Consumer went away: keep the message for the next one.
            self.consumers.remove(queue);
            self.stored
                .entry(queue.to_string())
                .or_default()
                .push_back(body);
            return;
        }
        self.unacked.insert(tag, (queue.to_string(), body));
        self.events.push(BrokerEvent::Delivered {
            queue: queue.to_string(),
            tag,
        });
    }

    fn settle(&mut self, tag: DeliveryTag) -> Result<(String, Vec<u8>), BrokerError> {
        self.unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))
    }
}

#[derive(Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    changed: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Put a message on a queue, as an upstream producer would.
    pub fn send(&self, queue: &str, body: Vec<u8>) {
        self.state().route(queue, body);
        self.changed.notify_waiters();
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        let state = self.state();
        BrokerSnapshot {
            events: state.events.clone(),
            stored: state
                .stored
                .iter()
                .map(|(route, bodies)| (route.clone(), bodies.iter().cloned().collect()))
                .collect(),
            unacked: state.unacked.len(),
        }
    }

    /// Wait until `predicate` holds for the broker state, at most `timeout`.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl Fn(&BrokerSnapshot) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if predicate(&self.snapshot()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return predicate(&self.snapshot());
            }
        }
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn consume(&self, queue: &str) -> Result<Deliveries, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            if state.consumers.get(queue).is_some_and(|c| !c.is_closed()) {
                return Err(BrokerError::AlreadyConsuming(queue.to_string()));
            }
            state.consumers.insert(queue.to_string(), tx);
            let backlog = state.stored.remove(queue).unwrap_or_default();
            for body in backlog {
                state.route(queue, body);
            }
        }
        self.changed.notify_waiters();
        Ok(rx)
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        {
            let mut state = self.state();
            state.settle(tag)?;
            state.events.push(BrokerEvent::Acked { tag });
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        {
            let mut state = self.state();
            let (queue, body) = state.settle(tag)?;
            state.events.push(BrokerEvent::Rejected { tag, requeue });
            if requeue {
                state.route(&queue, body);
            }
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        queue: &str,
        tag: DeliveryTag,
        body: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.state();
            state.settle(tag)?;
            state.events.push(BrokerEvent::DeadLettered {
                queue: queue.to_string(),
                tag,
            });
        }
        self.changed.notify_waiters();

        let state = Arc::clone(&self.state);
        let changed = Arc::clone(&self.changed);
        let queue = queue.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            lock(&state).route(&queue, body);
            changed.notify_waiters();
        });
        Ok(())
    }

    async fn publish(&self, route: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        {
            let mut state = self.state();
            state.events.push(BrokerEvent::Published {
                route: route.to_string(),
            });
            state.route(route, body);
        }
        self.changed.notify_waiters();
        Ok(())
    }
}

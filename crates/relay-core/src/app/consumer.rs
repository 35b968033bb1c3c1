//! Consumer - turns the deliveries of one input queue into tasks.

use std::sync::Arc;

use tokio::sync::{Semaphore, watch};

use crate::domain::{Message, Task};
use crate::ports::{Broker, Deliveries, Delivery, MessageCodec};
use crate::queue::PriorityTaskQueue;

pub(crate) struct Consumer<M> {
    pub(crate) queue: String,
    pub(crate) priority: i32,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) codec: Arc<dyn MessageCodec<M>>,
    pub(crate) tasks: Arc<PriorityTaskQueue<M>>,
    /// One permit per worker. A task holds its permit until it is settled.
    pub(crate) permits: Arc<Semaphore>,
}

impl<M: Message> Consumer<M> {
    /// Consume until shutdown, then give back what was not taken yet.
    pub(crate) async fn run(self, mut deliveries: Deliveries, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(queue = %self.queue, priority = self.priority, "consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delivery = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                delivery = deliveries.recv() => delivery,
            };
            let Some(delivery) = delivery else {
                tracing::warn!(queue = %self.queue, "delivery stream closed");
                return;
            };
            self.handle_delivery(delivery).await;
        }

        deliveries.close();
        while let Ok(delivery) = deliveries.try_recv() {
            self.requeue(&delivery).await;
        }
        tracing::info!(queue = %self.queue, "consumer stopped");
    }

    /// Wait for a free worker, decode the delivery and queue it.
    ///
    /// Exactly one task per decodable delivery. A closed semaphore (engine
    /// stopping) hands the delivery back to the broker.
    pub(crate) async fn handle_delivery(&self, delivery: Delivery) {
        let permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                self.requeue(&delivery).await;
                return;
            }
        };

        match self.codec.deserialize(&delivery.body) {
            Ok(mut message) => {
                message
                    .envelope_mut()
                    .stamp_delivery(&self.queue, delivery.tag, &delivery.body);
                tracing::debug!(
                    queue = %self.queue,
                    tag = %delivery.tag,
                    id = message.id(),
                    tracing_id = message.tracing_id(),
                    "task queued"
                );
                // The worker gives the permit back once the task is settled.
                permit.forget();
                self.tasks.push(Task::new(message, self.priority)).await;
            }
            Err(err) => {
                tracing::error!(
                    queue = %self.queue,
                    tag = %delivery.tag,
                    error = %err,
                    body = %String::from_utf8_lossy(&delivery.body),
                    "dropping undecodable message"
                );
                if let Err(err) = self.broker.ack(delivery.tag).await {
                    tracing::error!(queue = %self.queue, error = %err, "ack of dropped message failed");
                }
                // No task was created, so nothing else would return the permit.
                drop(permit);
            }
        }
    }

    async fn requeue(&self, delivery: &Delivery) {
        tracing::warn!(queue = %self.queue, tag = %delivery.tag, "engine stopping, requeueing delivery");
        if let Err(err) = self.broker.reject(delivery.tag, true).await {
            tracing::error!(queue = %self.queue, error = %err, "requeue failed");
        }
    }
}

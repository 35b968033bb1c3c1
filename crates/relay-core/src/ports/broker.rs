//! Broker port - the external message queue the engine reads from and writes to.
//!
//! Topology assumed per input queue: the queue itself, a dead-letter
//! destination that returns messages to the queue after a TTL, and a failed
//! queue for messages that ran out of retries.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::DeliveryTag;

/// One raw delivery from an input queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
}

/// Stream of deliveries for one input queue.
pub type Deliveries = mpsc::UnboundedReceiver<Delivery>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown delivery {0}")]
    UnknownDelivery(DeliveryTag),

    #[error("queue {0} already has a consumer")]
    AlreadyConsuming(String),

    #[error("broker connection failed: {0}")]
    Connection(String),
}

/// Acknowledgement and publishing primitives.
///
/// Every delivery handed out by `consume` must be settled exactly once, by
/// `ack`, `reject` or `dead_letter`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Start consuming an input queue.
    async fn consume(&self, queue: &str) -> Result<Deliveries, BrokerError>;

    /// Settle a delivery as done (success or permanent failure).
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Give a delivery back. With `requeue = false` the message is dropped.
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    /// Settle a delivery by parking `body` in the dead-letter destination of
    /// `queue`. The broker redelivers it to `queue` after `ttl`.
    async fn dead_letter(
        &self,
        queue: &str,
        tag: DeliveryTag,
        body: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), BrokerError>;

    /// Send a message to a route (output queue, failed queue, ...).
    async fn publish(&self, route: &str, body: Vec<u8>) -> Result<(), BrokerError>;
}

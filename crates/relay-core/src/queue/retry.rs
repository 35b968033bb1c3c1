//! Failure policy: decides between a delayed retry and permanent failure.

use std::time::Duration;

/// Default number of retries before a message is routed to the failed queue.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default time a message waits in the dead-letter queue before redelivery.
pub const DEFAULT_DEAD_LETTER_WAIT: Duration = Duration::from_secs(30);

/// Failure policy of one input queue.
///
/// The engine never sleeps for a retry. A retried message is parked in the
/// queue's dead-letter destination with a TTL of `dead_letter_wait`; the
/// broker sends it back to `queue` once the TTL expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    queue: String,

    /// Retries allowed before the message is failed permanently.
    pub max_retries: u32,

    /// Delay before a retried message comes back.
    pub dead_letter_wait: Duration,

    /// Route for messages that exhausted their retries.
    pub failed_routing_key: String,
}

/// What to do with a message after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Dead-letter the message, the broker redelivers after `wait`.
    Retry { wait: Duration },

    /// Route to the failed queue and ack the original delivery.
    Fail,
}

impl FailurePolicy {
    pub fn new(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            failed_routing_key: format!("{queue}.failed"),
            queue,
            max_retries: DEFAULT_MAX_RETRIES,
            dead_letter_wait: DEFAULT_DEAD_LETTER_WAIT,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dead_letter_wait(mut self, wait: Duration) -> Self {
        self.dead_letter_wait = wait;
        self
    }

    pub fn with_failed_routing_key(mut self, key: impl Into<String>) -> Self {
        self.failed_routing_key = key.into();
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Decide based on the retry count *after* the failed attempt was counted.
    ///
    /// With `max_retries = 2` attempts 1 and 2 are retried (retries 1 and 2),
    /// attempt 3 (retries = 3) is failed.
    pub fn decide(&self, retries: u32) -> Decision {
        if retries <= self.max_retries {
            Decision::Retry {
                wait: self.dead_letter_wait,
            }
        } else {
            Decision::Fail
        }
    }
}

//! FlowSpec - a built pipeline, ready to be shared by all workers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use crate::domain::{Message, ProcessingError};

pub type ReaderFn<M, R> = dyn Fn(&M) -> Result<R, ProcessingError> + Send + Sync;
pub type TransformerFn<R, W> = dyn Fn(R) -> Result<W, ProcessingError> + Send + Sync;
pub type WriterFn<W, O> = dyn Fn(W) -> Result<Option<O>, ProcessingError> + Send + Sync;

pub(crate) type Pipeline<M, O> =
    Box<dyn Fn(&M) -> Result<Option<O>, ProcessingError> + Send + Sync>;
pub(crate) type Cleanup = Box<dyn Fn() + Send + Sync>;
pub(crate) type Metrics = Box<dyn Fn(&FlowInfo) + Send + Sync>;
pub(crate) type LockKey<M> = Box<dyn Fn(&M) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Success,
    /// Failed, will be retried.
    ErrorRetry,
    /// Failed, goes to the failed queue.
    ErrorStop,
}

/// What the metrics hook gets to see about one attempt.
#[derive(Debug, Clone)]
pub struct FlowInfo {
    pub queue: String,
    pub tracing_id: Option<String>,
    pub status: FlowStatus,
    /// Time spent in the pipeline itself.
    pub duration: Duration,
    /// Time spent waiting for the message's lock, zero without a lock key.
    pub lock_wait: Duration,
    /// Retry count after this attempt.
    pub retries: u32,
}

pub struct FlowSpec<M, O = M> {
    pub(crate) pipeline: Pipeline<M, O>,
    pub(crate) cleanup: Option<Cleanup>,
    pub(crate) metrics: Option<Metrics>,
    pub(crate) lock_key: Option<LockKey<M>>,
    pub(crate) propagate_tracing_ids: bool,
}

impl<M: Message, O: Message> FlowSpec<M, O> {
    /// Run reader, transformer and writer on `message`.
    ///
    /// With tracing id propagation on, an outgoing message inherits the
    /// incoming message's tracing id.
    pub fn process(&self, message: &M) -> Result<Option<O>, ProcessingError> {
        let mut outgoing = (self.pipeline)(message)?;
        if self.propagate_tracing_ids {
            if let (Some(out), Some(tracing_id)) = (outgoing.as_mut(), message.tracing_id()) {
                out.set_tracing_id(Some(tracing_id.to_string()));
            }
        }
        Ok(outgoing)
    }

    /// Lock id the message must hold while it is processed, if any.
    pub fn lock_key(&self, message: &M) -> Option<String> {
        self.lock_key.as_ref().and_then(|key| key(message))
    }

    pub fn propagates_tracing_ids(&self) -> bool {
        self.propagate_tracing_ids
    }

    /// Run the cleanup hook, then the metrics hook.
    ///
    /// A panicking hook is logged and never stops the other one from running.
    pub fn finish(&self, info: &FlowInfo) {
        if let Some(cleanup) = &self.cleanup {
            if catch_unwind(AssertUnwindSafe(|| cleanup())).is_err() {
                tracing::error!(queue = %info.queue, "cleanup hook panicked");
            }
        }
        if let Some(metrics) = &self.metrics {
            if catch_unwind(AssertUnwindSafe(|| metrics(info))).is_err() {
                tracing::error!(queue = %info.queue, "metrics hook panicked");
            }
        }
    }
}

impl<M, O> std::fmt::Debug for FlowSpec<M, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowSpec")
            .field("cleanup", &self.cleanup.is_some())
            .field("metrics", &self.metrics.is_some())
            .field("lock_key", &self.lock_key.is_some())
            .field("propagate_tracing_ids", &self.propagate_tracing_ids)
            .finish_non_exhaustive()
    }
}

//! EngineBuilder - wiring of broker, flow, locks and reporting into an [`Engine`].
//!
//! Everything is checked in `build()`, so a misconfigured engine never starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::config::Config;
use crate::domain::Message;
use crate::error::EngineError;
use crate::flow::FlowSpec;
use crate::impls::{JsonCodec, LoggingReport};
use crate::lock::LockManager;
use crate::ports::{Broker, MessageCodec, ProcessReport};
use crate::queue::{FailurePolicy, PriorityTaskQueue};

use super::engine::Engine;
use super::status::Activity;
use super::worker_loop::WorkerContext;

const DEFAULT_THREADS: usize = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("no broker set")]
    MissingBroker,

    #[error("no flow set")]
    MissingFlow,

    #[error("no input queue set")]
    NoInputQueues,

    #[error("input queue {0} is configured twice")]
    DuplicateInput(String),

    #[error("thread count must be at least 1")]
    NoThreads,

    #[error("task queue capacity {capacity} is below the thread count {threads}")]
    QueueTooSmall { capacity: usize, threads: usize },
}

/// One input queue: its priority and failure policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputQueue {
    pub name: String,
    pub priority: i32,
    pub policy: FailurePolicy,
}

impl InputQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            policy: FailurePolicy::new(&name),
            name,
            priority: 0,
        }
    }

    pub fn from_policy(policy: FailurePolicy, priority: i32) -> Self {
        Self {
            name: policy.queue().to_string(),
            priority,
            policy,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    pub fn dead_letter_wait(mut self, wait: Duration) -> Self {
        self.policy.dead_letter_wait = wait;
        self
    }

    pub fn failed_routing_key(mut self, key: impl Into<String>) -> Self {
        self.policy.failed_routing_key = key.into();
        self
    }
}

/// Builds an [`Engine`].
///
/// # Example
/// ```ignore
/// let engine = EngineBuilder::new()
///     .broker(broker)
///     .flow(flow)
///     .input(InputQueue::new("first").priority(10))
///     .input(InputQueue::new("second"))
///     .write_to("out")
///     .threads(4)
///     .build()?;
/// let handle = engine.start().await?;
/// ```
pub struct EngineBuilder<M, O = M> {
    broker: Option<Arc<dyn Broker>>,
    flow: Option<FlowSpec<M, O>>,
    locks: Option<Arc<LockManager>>,
    report: Arc<dyn ProcessReport<M>>,
    codec: Arc<dyn MessageCodec<M>>,
    output_codec: Arc<dyn MessageCodec<O>>,
    threads: usize,
    inputs: Vec<InputQueue>,
    write_to: Option<String>,
    queue_capacity: Option<usize>,
}

impl<M: Message, O: Message> EngineBuilder<M, O> {
    pub fn new() -> Self {
        Self {
            broker: None,
            flow: None,
            locks: None,
            report: Arc::new(LoggingReport),
            codec: Arc::new(JsonCodec),
            output_codec: Arc::new(JsonCodec),
            threads: DEFAULT_THREADS,
            inputs: Vec::new(),
            write_to: None,
            queue_capacity: None,
        }
    }

    /// Threads, input queues, output route and locks from a [`Config`].
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        config.validate()?;
        let mut builder = Self::new()
            .threads(config.processing.threads)
            .lock_manager(Arc::new(LockManager::from_config(&config.redis)?));
        for queue in &config.routing.read_from {
            builder = builder.input(InputQueue::from_policy(
                config.failure_policy(queue),
                config.priority(queue),
            ));
        }
        if let Some(route) = &config.routing.write_to {
            builder = builder.write_to(route.clone());
        }
        Ok(builder)
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn flow(mut self, flow: FlowSpec<M, O>) -> Self {
        self.flow = Some(flow);
        self
    }

    /// Defaults to a process-local manager.
    pub fn lock_manager(mut self, locks: Arc<LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Defaults to [`LoggingReport`].
    pub fn report(mut self, report: Arc<dyn ProcessReport<M>>) -> Self {
        self.report = report;
        self
    }

    /// Codec for incoming messages. Defaults to [`JsonCodec`].
    pub fn codec(mut self, codec: Arc<dyn MessageCodec<M>>) -> Self {
        self.codec = codec;
        self
    }

    /// Codec for outgoing messages. Defaults to [`JsonCodec`].
    pub fn output_codec(mut self, codec: Arc<dyn MessageCodec<O>>) -> Self {
        self.output_codec = codec;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn input(mut self, input: InputQueue) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn write_to(mut self, route: impl Into<String>) -> Self {
        self.write_to = Some(route.into());
        self
    }

    /// Bound the task queue. Unbounded by default.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<Engine<M, O>, BuildError> {
        let broker = self.broker.ok_or(BuildError::MissingBroker)?;
        let flow = self.flow.ok_or(BuildError::MissingFlow)?;
        if self.threads == 0 {
            return Err(BuildError::NoThreads);
        }
        if self.inputs.is_empty() {
            return Err(BuildError::NoInputQueues);
        }

        let mut policies = HashMap::with_capacity(self.inputs.len());
        for input in &self.inputs {
            if policies
                .insert(input.name.clone(), input.policy.clone())
                .is_some()
            {
                return Err(BuildError::DuplicateInput(input.name.clone()));
            }
        }

        let tasks = match self.queue_capacity {
            Some(capacity) if capacity < self.threads => {
                return Err(BuildError::QueueTooSmall {
                    capacity,
                    threads: self.threads,
                });
            }
            Some(capacity) => PriorityTaskQueue::bounded(capacity),
            None => PriorityTaskQueue::unbounded(),
        };

        let context = WorkerContext {
            broker,
            flow,
            locks: self.locks.unwrap_or_else(|| Arc::new(LockManager::local())),
            report: self.report,
            codec: self.codec,
            output_codec: self.output_codec,
            tasks: Arc::new(tasks),
            permits: Arc::new(Semaphore::new(self.threads)),
            policies,
            write_to: self.write_to,
            activity: Activity::default(),
        };
        Ok(Engine {
            context: Arc::new(context),
            threads: self.threads,
            inputs: self.inputs,
        })
    }
}

impl<M: Message, O: Message> Default for EngineBuilder<M, O> {
    fn default() -> Self {
        Self::new()
    }
}

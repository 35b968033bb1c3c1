//! WorkerLoop - one worker of the pool.
//!
//! pop → (lock) → reader/transformer/writer → unlock → publish →
//! cleanup/metrics → settle the delivery → give the permit back.
//!
//! The attempt itself runs on a blocking thread: pipelines may block, and
//! lock ownership belongs to the OS thread that called `acquire`.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{Semaphore, watch};

use crate::domain::{Message, ProcessingError, Task};
use crate::flow::{FlowInfo, FlowSpec, FlowStatus};
use crate::lock::LockManager;
use crate::ports::{Broker, MessageCodec, ProcessReport};
use crate::queue::{Decision, FailurePolicy, PriorityTaskQueue};

use super::status::Activity;

/// Everything the workers share.
pub(crate) struct WorkerContext<M, O> {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) flow: FlowSpec<M, O>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) report: Arc<dyn ProcessReport<M>>,
    pub(crate) codec: Arc<dyn MessageCodec<M>>,
    pub(crate) output_codec: Arc<dyn MessageCodec<O>>,
    pub(crate) tasks: Arc<PriorityTaskQueue<M>>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) policies: HashMap<String, FailurePolicy>,
    pub(crate) write_to: Option<String>,
    pub(crate) activity: Activity,
}

impl<M: Message, O: Message> WorkerContext<M, O> {
    pub(crate) async fn run(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(worker, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            // pop() may wait, so race it against shutdown. It is cancel safe.
            let task = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                task = self.tasks.pop() => task,
            };

            self.activity.begin();
            Arc::clone(&self).process(worker, task).await;
            self.activity.end();
            self.permits.add_permits(1);
        }
        tracing::debug!(worker, "worker stopped");
    }

    async fn process(self: Arc<Self>, worker: usize, task: Task<M>) {
        let message = task.into_message();
        let queue = message.envelope().source().to_string();
        let tag = message.envelope().delivery_tag();
        let policy = self
            .policies
            .get(&queue)
            .cloned()
            .unwrap_or_else(|| FailurePolicy::new(&queue));
        tracing::debug!(
            worker,
            queue = %queue,
            tag = %tag,
            tracing_id = message.tracing_id(),
            retries = message.envelope().retries(),
            "processing"
        );

        let context = Arc::clone(&self);
        let attempt_policy = policy.clone();
        let runtime = Handle::current();
        let joined = tokio::task::spawn_blocking(move || {
            let mut message = message;
            let result = context.attempt(&mut message, &attempt_policy, &runtime);
            (message, result)
        })
        .await;

        match joined {
            Ok((message, result)) => self.settle(message, result, &policy).await,
            Err(err) => {
                tracing::error!(worker, queue = %queue, tag = %tag, error = %err, "attempt aborted, requeueing");
                if let Err(err) = self.broker.reject(tag, true).await {
                    tracing::error!(queue = %queue, error = %err, "requeue failed");
                }
            }
        }
    }

    /// Run the pipeline once and publish its output, on the calling
    /// (blocking) thread. The hooks see the outcome including the publish.
    fn attempt(
        &self,
        message: &mut M,
        policy: &FailurePolicy,
        runtime: &Handle,
    ) -> Result<(), ProcessingError> {
        let started = Instant::now();
        let mut lock_wait = Duration::ZERO;

        let processed = catch_unwind(AssertUnwindSafe(
            || -> Result<Option<O>, ProcessingError> {
                if let Some(id) = self.flow.lock_key(message) {
                    let waiting = Instant::now();
                    self.locks.acquire(&id)?;
                    lock_wait = waiting.elapsed();
                }
                self.flow.process(message)
            },
        ))
        .unwrap_or_else(|panic| Err(ProcessingError::Panicked(panic_message(&*panic))));
        self.locks.release();
        let duration = started.elapsed().saturating_sub(lock_wait);

        let result = match processed {
            Ok(Some(outgoing)) => runtime.block_on(self.publish(&outgoing)),
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };

        let retries = match &result {
            Err(err) if err.is_retryable() => message.envelope_mut().increment_retries(),
            _ => message.envelope().retries(),
        };
        let status = match &result {
            Ok(()) => FlowStatus::Success,
            Err(err) if err.is_retryable() && policy.decide(retries) != Decision::Fail => {
                FlowStatus::ErrorRetry
            }
            Err(_) => FlowStatus::ErrorStop,
        };

        self.flow.finish(&FlowInfo {
            queue: policy.queue().to_string(),
            tracing_id: message.tracing_id().map(str::to_string),
            status,
            duration,
            lock_wait,
            retries,
        });
        result
    }

    /// Ack, dead-letter or fail the delivery behind `message`.
    async fn settle(&self, message: M, result: Result<(), ProcessingError>, policy: &FailurePolicy) {
        if let Err(err) = result {
            return self.fail(message, err, policy).await;
        }
        let tag = message.envelope().delivery_tag();
        match self.broker.ack(tag).await {
            Ok(()) => self.report.report_success(&message),
            Err(err) => tracing::error!(queue = %policy.queue(), tag = %tag, error = %err, "ack failed"),
        }
    }

    async fn publish(&self, outgoing: &O) -> Result<(), ProcessingError> {
        let Some(route) = &self.write_to else {
            tracing::warn!(id = outgoing.id(), "flow produced a message but no output route is set, dropping it");
            return Ok(());
        };
        let body = self
            .output_codec
            .serialize(outgoing)
            .map_err(|err| ProcessingError::retry(err.to_string()))?;
        self.broker
            .publish(route, body)
            .await
            .map_err(|err| ProcessingError::retry(format!("publish to {route} failed: {err}")))
    }

    /// Apply the failure policy. The retry count was already updated.
    async fn fail(&self, message: M, error: ProcessingError, policy: &FailurePolicy) {
        let tag = message.envelope().delivery_tag();
        let retries = message.envelope().retries();

        if error.is_retryable() {
            if let Decision::Retry { wait } = policy.decide(retries) {
                match self.codec.serialize(&message) {
                    Ok(body) => {
                        match self.broker.dead_letter(policy.queue(), tag, body, wait).await {
                            Ok(()) => self.report.report_retry(&message, &error),
                            Err(err) => {
                                tracing::error!(queue = %policy.queue(), tag = %tag, error = %err, "dead-lettering failed, requeueing");
                                if let Err(err) = self.broker.reject(tag, true).await {
                                    tracing::error!(queue = %policy.queue(), tag = %tag, error = %err, "requeue failed");
                                }
                            }
                        }
                        return;
                    }
                    Err(err) => {
                        tracing::error!(queue = %policy.queue(), error = %err, "cannot encode message for retry, failing it");
                    }
                }
            }
        }

        let body = self
            .codec
            .serialize(&message)
            .unwrap_or_else(|_| raw_body(&message));
        if let Err(err) = self.broker.publish(&policy.failed_routing_key, body).await {
            tracing::error!(route = %policy.failed_routing_key, error = %err, "publishing failed message failed");
        }
        if let Err(err) = self.broker.ack(tag).await {
            tracing::error!(queue = %policy.queue(), tag = %tag, error = %err, "ack failed");
        }
        self.report.report_fail(&message, &error);
    }
}

fn raw_body<M: Message>(message: &M) -> Vec<u8> {
    message
        .envelope()
        .body()
        .map(|body| body.as_bytes().to_vec())
        .unwrap_or_default()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

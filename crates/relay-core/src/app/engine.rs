//! Engine - the worker pool plus one consumer per input queue.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::Message;
use crate::error::EngineError;
use crate::lock::LockManager;

use super::builder::InputQueue;
use super::consumer::Consumer;
use super::status::EngineStatus;
use super::worker_loop::WorkerContext;

/// A configured engine, not running yet. Built by [`EngineBuilder`](super::EngineBuilder).
pub struct Engine<M, O = M> {
    pub(crate) context: Arc<WorkerContext<M, O>>,
    pub(crate) threads: usize,
    pub(crate) inputs: Vec<InputQueue>,
}

impl<M: Message, O: Message> Engine<M, O> {
    /// Subscribe to every input queue and spawn the workers.
    ///
    /// Fails if the broker refuses a subscription; nothing is left running then.
    pub async fn start(self) -> Result<EngineHandle<M, O>, EngineError> {
        let mut subscriptions = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let deliveries = self.context.broker.consume(&input.name).await?;
            subscriptions.push((input, deliveries));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut consumers = Vec::with_capacity(subscriptions.len());
        for (input, deliveries) in subscriptions {
            let consumer = Consumer {
                queue: input.name.clone(),
                priority: input.priority,
                broker: Arc::clone(&self.context.broker),
                codec: Arc::clone(&self.context.codec),
                tasks: Arc::clone(&self.context.tasks),
                permits: Arc::clone(&self.context.permits),
            };
            let shutdown = shutdown_rx.clone();
            consumers.push(tokio::spawn(consumer.run(deliveries, shutdown)));
        }

        let mut workers = Vec::with_capacity(self.threads);
        for worker in 0..self.threads {
            let context = Arc::clone(&self.context);
            let shutdown = shutdown_rx.clone();
            workers.push(tokio::spawn(context.run(worker, shutdown)));
        }

        tracing::info!(
            threads = self.threads,
            queues = ?self.inputs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            "engine started"
        );
        Ok(EngineHandle {
            context: self.context,
            shutdown_tx,
            consumers,
            workers,
        })
    }
}

/// Handle of a running engine.
///
/// Dropping it without [`stop`](EngineHandle::stop) stops the loops too, but
/// without requeueing what is still buffered.
pub struct EngineHandle<M, O = M> {
    context: Arc<WorkerContext<M, O>>,
    shutdown_tx: watch::Sender<bool>,
    consumers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl<M: Message, O: Message> EngineHandle<M, O> {
    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            queued: self.context.tasks.len().await,
            processing: self.context.activity.processing(),
            available_workers: self.context.permits.available_permits(),
            peak_processing: self.context.activity.peak(),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.context.locks
    }

    /// Stop consuming, let in-flight tasks finish, then return.
    ///
    /// Deliveries that were received but not processed are rejected with
    /// requeue, so the broker hands them out again.
    pub async fn stop(self) {
        tracing::info!("engine stopping");
        let _ = self.shutdown_tx.send(true);
        // Consumers waiting for a permit give their delivery back.
        self.context.permits.close();

        for consumer in self.consumers {
            let _ = consumer.await;
        }
        for worker in self.workers {
            let _ = worker.await;
        }

        while let Some(task) = self.context.tasks.try_pop().await {
            let envelope = task.message().envelope();
            tracing::debug!(queue = %envelope.source(), tag = %envelope.delivery_tag(), "requeueing unprocessed task");
            if let Err(err) = self
                .context
                .broker
                .reject(envelope.delivery_tag(), true)
                .await
            {
                tracing::error!(queue = %envelope.source(), error = %err, "requeue failed");
            }
        }
        tracing::info!("engine stopped");
    }
}

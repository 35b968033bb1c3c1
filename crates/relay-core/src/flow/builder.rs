//! FlowBuilder - staged construction of a [`FlowSpec`].
//!
//! Every step is its own type, so the order `reader → (transformer) → writer`
//! is checked by the compiler. A transformer cannot be set before a reader:
//!
//! ```compile_fail
//! use relay_core::domain::{DefaultMessage, ProcessingError};
//! use relay_core::flow::FlowBuilder;
//!
//! let _ = FlowBuilder::flow::<DefaultMessage, DefaultMessage>()
//!     .transformer(|s: String| Ok::<_, ProcessingError>(s));
//! ```
//!
//! Leaving out the transformer means the reader's value goes to the writer
//! untouched, which only compiles when both sides agree on its type:
//!
//! ```compile_fail
//! use relay_core::domain::{DefaultMessage, ProcessingError};
//! use relay_core::flow::FlowBuilder;
//!
//! let _ = FlowBuilder::flow::<DefaultMessage, DefaultMessage>()
//!     .reader(|m: &DefaultMessage| Ok::<_, ProcessingError>(m.id().len()))
//!     .writer(|s: String| Ok::<_, ProcessingError>(Some(DefaultMessage::new(s))))
//!     .build();
//! ```
//!
//! A complete flow:
//!
//! ```
//! use relay_core::domain::{DefaultMessage, Message, ProcessingError};
//! use relay_core::flow::FlowBuilder;
//!
//! let flow = FlowBuilder::flow::<DefaultMessage, DefaultMessage>()
//!     .reader(|m: &DefaultMessage| Ok::<_, ProcessingError>(m.id().to_string()))
//!     .transformer(|id: String| Ok(id.to_uppercase()))
//!     .writer(|id: String| Ok(Some(DefaultMessage::new(id))))
//!     .build();
//!
//! let out = flow.process(&DefaultMessage::new("abc")).unwrap().unwrap();
//! assert_eq!(out.id(), "ABC");
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use crate::domain::{Message, ProcessingError};

use super::provider::Provider;
use super::spec::{
    Cleanup, FlowInfo, FlowSpec, LockKey, Metrics, Pipeline, ReaderFn, TransformerFn, WriterFn,
};

/// Entry point for building flows.
pub struct FlowBuilder;

impl FlowBuilder {
    /// Flow reading `M` and (optionally) emitting `O`.
    pub fn flow<M: Message, O: Message>() -> ReaderStep<M, O> {
        ReaderStep {
            _types: PhantomData,
        }
    }

    /// Flow made of a single message-to-message function.
    pub fn message_processor<M: Message, O: Message>() -> ProcessorStep<M, O> {
        ProcessorStep {
            _types: PhantomData,
        }
    }
}

pub struct ReaderStep<M, O> {
    _types: PhantomData<fn(M) -> O>,
}

impl<M: Message, O: Message> ReaderStep<M, O> {
    /// Shared reader, called concurrently by all workers.
    pub fn reader<R, F>(self, reader: F) -> TransformerStep<M, O, R>
    where
        R: 'static,
        F: Fn(&M) -> Result<R, ProcessingError> + Send + Sync + 'static,
    {
        let reader: Arc<ReaderFn<M, R>> = Arc::new(reader);
        TransformerStep {
            reader: Provider::shared(reader),
            _types: PhantomData,
        }
    }

    /// Reader built fresh for every message.
    pub fn reader_factory<R, F, P>(self, factory: P) -> TransformerStep<M, O, R>
    where
        R: 'static,
        F: Fn(&M) -> Result<R, ProcessingError> + Send + Sync + 'static,
        P: Fn() -> F + Send + Sync + 'static,
    {
        TransformerStep {
            reader: Provider::factory(move || -> Box<ReaderFn<M, R>> { Box::new(factory()) }),
            _types: PhantomData,
        }
    }
}

pub struct TransformerStep<M, O, R> {
    reader: Provider<ReaderFn<M, R>>,
    _types: PhantomData<fn(M) -> O>,
}

impl<M: Message, O: Message, R: 'static> TransformerStep<M, O, R> {
    pub fn transformer<W, F>(self, transformer: F) -> WriterStep<M, O, R, W>
    where
        W: 'static,
        F: Fn(R) -> Result<W, ProcessingError> + Send + Sync + 'static,
    {
        let transformer: Arc<TransformerFn<R, W>> = Arc::new(transformer);
        WriterStep {
            reader: self.reader,
            transformer: Provider::shared(transformer),
            _types: PhantomData,
        }
    }

    pub fn transformer_factory<W, F, P>(self, factory: P) -> WriterStep<M, O, R, W>
    where
        W: 'static,
        F: Fn(R) -> Result<W, ProcessingError> + Send + Sync + 'static,
        P: Fn() -> F + Send + Sync + 'static,
    {
        WriterStep {
            reader: self.reader,
            transformer: Provider::factory(move || -> Box<TransformerFn<R, W>> {
                Box::new(factory())
            }),
            _types: PhantomData,
        }
    }

    /// Writer taking the reader's value as is.
    pub fn writer<F>(self, writer: F) -> ConfigurationStep<M, O>
    where
        F: Fn(R) -> Result<Option<O>, ProcessingError> + Send + Sync + 'static,
    {
        self.identity().writer(writer)
    }

    pub fn writer_factory<F, P>(self, factory: P) -> ConfigurationStep<M, O>
    where
        F: Fn(R) -> Result<Option<O>, ProcessingError> + Send + Sync + 'static,
        P: Fn() -> F + Send + Sync + 'static,
    {
        self.identity().writer_factory(factory)
    }

    /// Terminal writer that sinks the reader's value and emits nothing.
    pub fn consume<F>(self, consumer: F) -> ConfigurationStep<M, O>
    where
        F: Fn(R) -> Result<(), ProcessingError> + Send + Sync + 'static,
    {
        self.identity().consume(consumer)
    }

    fn identity(self) -> WriterStep<M, O, R, R> {
        self.transformer(Ok)
    }
}

pub struct WriterStep<M, O, R, W> {
    reader: Provider<ReaderFn<M, R>>,
    transformer: Provider<TransformerFn<R, W>>,
    _types: PhantomData<fn(M) -> O>,
}

impl<M: Message, O: Message, R: 'static, W: 'static> WriterStep<M, O, R, W> {
    pub fn writer<F>(self, writer: F) -> ConfigurationStep<M, O>
    where
        F: Fn(W) -> Result<Option<O>, ProcessingError> + Send + Sync + 'static,
    {
        let writer: Arc<WriterFn<W, O>> = Arc::new(writer);
        self.finish(Provider::shared(writer))
    }

    pub fn writer_factory<F, P>(self, factory: P) -> ConfigurationStep<M, O>
    where
        F: Fn(W) -> Result<Option<O>, ProcessingError> + Send + Sync + 'static,
        P: Fn() -> F + Send + Sync + 'static,
    {
        self.finish(Provider::factory(move || -> Box<WriterFn<W, O>> {
            Box::new(factory())
        }))
    }

    pub fn consume<F>(self, consumer: F) -> ConfigurationStep<M, O>
    where
        F: Fn(W) -> Result<(), ProcessingError> + Send + Sync + 'static,
    {
        self.writer(move |value| consumer(value).map(|()| None))
    }

    fn finish(self, writer: Provider<WriterFn<W, O>>) -> ConfigurationStep<M, O> {
        let Self {
            reader,
            transformer,
            ..
        } = self;
        let pipeline: Pipeline<M, O> = Box::new(move |message: &M| {
            let read = (reader.get())(message)?;
            let transformed = (transformer.get())(read)?;
            (writer.get())(transformed)
        });
        ConfigurationStep::new(pipeline)
    }
}

pub struct ProcessorStep<M, O> {
    _types: PhantomData<fn(M) -> O>,
}

impl<M: Message, O: Message> ProcessorStep<M, O> {
    pub fn process<F>(self, process: F) -> ConfigurationStep<M, O>
    where
        F: Fn(&M) -> Result<O, ProcessingError> + Send + Sync + 'static,
    {
        ConfigurationStep::new(Box::new(move |message: &M| process(message).map(Some)))
    }
}

/// Optional hooks, then [`build`](ConfigurationStep::build).
pub struct ConfigurationStep<M, O> {
    pipeline: Pipeline<M, O>,
    cleanup: Option<Cleanup>,
    metrics: Option<Metrics>,
    lock_key: Option<LockKey<M>>,
    propagate_tracing_ids: bool,
}

impl<M: Message, O: Message> ConfigurationStep<M, O> {
    fn new(pipeline: Pipeline<M, O>) -> Self {
        Self {
            pipeline,
            cleanup: None,
            metrics: None,
            lock_key: None,
            propagate_tracing_ids: true,
        }
    }

    /// Runs after every message, whatever the outcome.
    pub fn cleanup(mut self, cleanup: impl Fn() + Send + Sync + 'static) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Receives status and timings of every attempt.
    pub fn metrics(mut self, metrics: impl Fn(&FlowInfo) + Send + Sync + 'static) -> Self {
        self.metrics = Some(Box::new(metrics));
        self
    }

    /// Lock id to hold while a message is processed. `None` means no lock.
    pub fn lock_key(
        mut self,
        lock_key: impl Fn(&M) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.lock_key = Some(Box::new(lock_key));
        self
    }

    pub fn propagate_tracing_ids(mut self, propagate: bool) -> Self {
        self.propagate_tracing_ids = propagate;
        self
    }

    pub fn build(self) -> FlowSpec<M, O> {
        FlowSpec {
            pipeline: self.pipeline,
            cleanup: self.cleanup,
            metrics: self.metrics,
            lock_key: self.lock_key,
            propagate_tracing_ids: self.propagate_tracing_ids,
        }
    }
}

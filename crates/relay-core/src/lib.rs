//! relay-core
//!
//! Message-driven job processing: deliveries from a broker are turned into
//! prioritized tasks, run through a reader → transformer → writer flow by a
//! fixed pool of workers, and then acked, retried via dead-lettering, or
//! failed.
//!
//! # Modules
//! - **domain**: messages, envelopes, tasks, processing errors
//! - **ports**: broker, codec, lock backend and report traits
//! - **impls**: in-memory broker, JSON codec, lock backends, logging report
//! - **queue**: priority task queue and failure policy
//! - **lock**: lock manager keyed by business id
//! - **flow**: staged flow builder
//! - **app**: engine builder, consumers and worker loop
//! - **config**: YAML configuration

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod flow;
pub mod impls;
pub mod lock;
pub mod ports;
pub mod queue;

pub use self::app::{Engine, EngineBuilder, EngineHandle, InputQueue};
pub use self::config::Config;
pub use self::domain::{DefaultMessage, Message, ProcessingError};
pub use self::flow::{FlowBuilder, FlowSpec};

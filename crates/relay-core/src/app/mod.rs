//! App - ports wired into a running engine.
//!
//! # Components
//! - **EngineBuilder**: wiring and startup validation
//! - **Engine / EngineHandle**: start, stop and status of the pool
//! - **Consumer**: one per input queue, deliveries → tasks
//! - **WorkerLoop**: pop → lock → pipeline → settle

pub mod builder;
pub mod consumer;
pub mod engine;
pub mod status;
pub mod worker_loop;

pub use self::builder::{BuildError, EngineBuilder, InputQueue};
pub use self::engine::{Engine, EngineHandle};
pub use self::status::EngineStatus;

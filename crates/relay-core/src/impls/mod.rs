//! Impls - implementations of the ports shipped with the crate.
//!
//! - **InMemoryBroker**: broker emulation with TTL redelivery (tests, local runs)
//! - **JsonCodec**: serde_json wire format
//! - **NoOpLockBackend / InMemoryLockBackend / RedisLockBackend**: lock stores
//! - **LoggingReport**: default ProcessReport

pub mod inmem_broker;
pub mod inmem_lock;
pub mod json_codec;
pub mod redis_lock;
pub mod report;

pub use self::inmem_broker::{BrokerEvent, BrokerSnapshot, InMemoryBroker};
pub use self::inmem_lock::{InMemoryLockBackend, NoOpLockBackend};
pub use self::json_codec::JsonCodec;
pub use self::redis_lock::RedisLockBackend;
pub use self::report::LoggingReport;

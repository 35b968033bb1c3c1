//! Ports - boundaries to the systems around the engine.
//!
//! The core only talks to the broker, the wire format, the lock store and the
//! failure reporting through these traits. `impls` holds the implementations
//! shipped with the crate.

pub mod broker;
pub mod codec;
pub mod lock_backend;
pub mod report;

pub use self::broker::{Broker, BrokerError, Deliveries, Delivery};
pub use self::codec::{CodecError, MessageCodec};
pub use self::lock_backend::LockBackend;
pub use self::report::ProcessReport;

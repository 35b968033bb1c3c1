//! Domain model (messages, tasks, processing errors).

pub mod errors;
pub mod message;
pub mod task;

pub use self::errors::ProcessingError;
pub use self::message::{DefaultMessage, DeliveryTag, Envelope, Message};
pub use self::task::Task;

//! Queue module: the in-process priority task queue and the failure policy.

mod priority;
mod retry;

pub use priority::PriorityTaskQueue;
pub use retry::{DEFAULT_DEAD_LETTER_WAIT, DEFAULT_MAX_RETRIES, Decision, FailurePolicy};

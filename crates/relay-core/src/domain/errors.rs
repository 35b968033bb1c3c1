//! Errors raised while a message runs through a pipeline.

use thiserror::Error;

use crate::lock::LockError;

/// Failure of one processing attempt.
///
/// Whether the message is retried depends on the variant:
/// - `Retry`: recoverable, subject to the failure policy of the input queue.
/// - `Stop`: the message can never succeed, skip the remaining retries.
/// - `Locking`: the lock could not be taken. A wait that ran out is
///   contention and is retried; backend failures are not.
/// - `Panicked`: a pipeline stage panicked, handled like `Retry`.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("{0}")]
    Retry(String),

    #[error("processing stopped: {0}")]
    Stop(String),

    #[error(transparent)]
    Locking(#[from] LockError),

    #[error("pipeline panicked: {0}")]
    Panicked(String),
}

impl ProcessingError {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry(reason.into())
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self::Stop(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Retry(_) | Self::Panicked(_) | Self::Locking(LockError::Timeout(_))
        )
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Retry(format!("json: {err}"))
    }
}

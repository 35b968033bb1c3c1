//! LoggingReport - default ProcessReport writing to `tracing`.

use crate::domain::{Message, ProcessingError};
use crate::ports::ProcessReport;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingReport;

impl<M: Message> ProcessReport<M> for LoggingReport {
    fn report_success(&self, message: &M) {
        tracing::info!(
            id = message.id(),
            tracing_id = message.tracing_id(),
            queue = message.envelope().source(),
            "processed"
        );
    }

    fn report_retry(&self, message: &M, error: &ProcessingError) {
        tracing::warn!(
            id = message.id(),
            tracing_id = message.tracing_id(),
            queue = message.envelope().source(),
            retries = message.envelope().retries(),
            error = %error,
            "will retry"
        );
    }

    fn report_fail(&self, message: &M, error: &ProcessingError) {
        tracing::error!(
            id = message.id(),
            tracing_id = message.tracing_id(),
            queue = message.envelope().source(),
            retries = message.envelope().retries(),
            body = message.envelope().body(),
            error = %error,
            "failed permanently"
        );
    }
}

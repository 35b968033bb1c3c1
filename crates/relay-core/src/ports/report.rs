//! ProcessReport port - notified about the final outcome of each attempt.

use crate::domain::ProcessingError;

/// Receives processing outcomes, e.g. to log them or feed an alerting system.
///
/// `report_fail` is called once per message, when it is routed to the failed
/// queue; `message.envelope().retries()` then holds the final retry count.
pub trait ProcessReport<M>: Send + Sync {
    fn report_success(&self, _message: &M) {}

    fn report_retry(&self, _message: &M, _error: &ProcessingError) {}

    fn report_fail(&self, message: &M, error: &ProcessingError);
}

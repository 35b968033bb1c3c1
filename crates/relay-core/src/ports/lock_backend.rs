//! LockBackend port - shared store providing cross-process mutual exclusion.

use std::time::Duration;

use crate::lock::LockError;

/// Network side of the distributed lock.
///
/// Calls block the current thread; the lock manager only calls them from
/// worker threads that are allowed to block.
pub trait LockBackend: Send + Sync {
    /// Try to take `id`, waiting at most `timeout`. `Ok(false)` means another
    /// holder kept it for the whole wait.
    fn try_acquire(&self, id: &str, timeout: Duration) -> Result<bool, LockError>;

    fn release(&self, id: &str) -> Result<(), LockError>;

    fn is_held(&self, id: &str) -> Result<bool, LockError>;
}

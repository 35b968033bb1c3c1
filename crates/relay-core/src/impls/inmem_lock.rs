//! Lock backends that live inside the process.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::lock::LockError;
use crate::ports::LockBackend;

/// Backend for single-instance deployments: always grants immediately.
///
/// The lock manager's local table still excludes threads of this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLockBackend;

impl LockBackend for NoOpLockBackend {
    fn try_acquire(&self, _id: &str, _timeout: Duration) -> Result<bool, LockError> {
        Ok(true)
    }

    fn release(&self, _id: &str) -> Result<(), LockError> {
        Ok(())
    }

    fn is_held(&self, _id: &str) -> Result<bool, LockError> {
        Ok(false)
    }
}

/// Shared in-memory store.
///
/// Several lock managers over one instance behave like several processes over
/// one external store, which is what tests use it for.
#[derive(Default)]
pub struct InMemoryLockBackend {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LockBackend for InMemoryLockBackend {
    fn try_acquire(&self, id: &str, timeout: Duration) -> Result<bool, LockError> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held();
        while held.contains(id) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            held = guard;
        }
        held.insert(id.to_string());
        Ok(true)
    }

    fn release(&self, id: &str) -> Result<(), LockError> {
        let removed = self.held().remove(id);
        if removed {
            self.released.notify_all();
        }
        Ok(())
    }

    fn is_held(&self, id: &str) -> Result<bool, LockError> {
        Ok(self.held().contains(id))
    }
}

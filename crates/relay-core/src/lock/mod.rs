//! Distributed lock manager keyed by business ids.
//!
//! Ownership is tracked per OS thread: the thread that called `acquire` is the
//! holder, and `release` frees whatever that thread holds. Exclusion inside
//! the process is handled by a local table + condvar; exclusion across
//! processes is delegated to a [`LockBackend`].
//!
//! A thread must release its lock before acquiring a different id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::RedisConfig;
use crate::impls::{NoOpLockBackend, RedisLockBackend};
use crate::ports::LockBackend;

/// Default upper bound for a single `acquire` call.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Backend(String),

    #[error("could not acquire lock {0} in time")]
    Timeout(String),

    #[error("thread already holds lock {held}, cannot acquire {requested}")]
    AlreadyHolding { held: String, requested: String },
}

struct Holder {
    id: String,
    /// Set once the backend granted the lock.
    since: Option<Instant>,
}

#[derive(Default)]
struct LockTable {
    owners: HashMap<String, ThreadId>,
    holders: HashMap<ThreadId, Holder>,
}

/// Process-wide lock manager.
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    table: Mutex<LockTable>,
    released: Condvar,
    lock_wait: Duration,

    locks_acquired: AtomicU64,
    waited_ns: AtomicU64,
    held_ns: AtomicU64,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            lock_wait: DEFAULT_LOCK_WAIT,
            locks_acquired: AtomicU64::new(0),
            waited_ns: AtomicU64::new(0),
            held_ns: AtomicU64::new(0),
        }
    }

    /// Manager without cross-process exclusion (single instance, tests).
    pub fn local() -> Self {
        Self::new(Arc::new(NoOpLockBackend))
    }

    /// Redis backed manager if an address is configured, local otherwise.
    pub fn from_config(config: &RedisConfig) -> Result<Self, LockError> {
        let Some(address) = config.normalized_address() else {
            tracing::info!("no redis address configured, locks are process-local");
            return Ok(Self::local());
        };
        let backend = RedisLockBackend::connect(
            &address,
            config.password.as_deref(),
            &config.key_prefix,
            Duration::from_millis(config.lease_ms),
        )?;
        tracing::info!(address = %address, "using redis lock backend");
        Ok(Self::new(Arc::new(backend)).with_lock_wait(Duration::from_millis(config.lock_wait_ms)))
    }

    /// Upper bound for one `acquire` call, local and backend wait combined.
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `id` is free in this and every other process, then hold it.
    ///
    /// Re-acquiring the id the thread already holds is a no-op. Backend errors
    /// and an exceeded wait are returned as is, without retrying.
    pub fn acquire(&self, id: &str) -> Result<(), LockError> {
        let me = thread::current().id();
        let started = Instant::now();
        let deadline = started + self.lock_wait;

        {
            let mut table = self.table();
            if let Some(holder) = table.holders.get(&me) {
                if holder.id == id {
                    return Ok(());
                }
                return Err(LockError::AlreadyHolding {
                    held: holder.id.clone(),
                    requested: id.to_string(),
                });
            }

            while table.owners.contains_key(id) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(LockError::Timeout(id.to_string()));
                }
                let (guard, _) = self
                    .released
                    .wait_timeout(table, remaining)
                    .unwrap_or_else(PoisonError::into_inner);
                table = guard;
            }

            // Claim locally first so other threads of this process wait on the
            // condvar instead of competing for the backend.
            table.owners.insert(id.to_string(), me);
            table.holders.insert(
                me,
                Holder {
                    id: id.to_string(),
                    since: None,
                },
            );
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let granted = self.backend.try_acquire(id, remaining);
        match granted {
            Ok(true) => {}
            Ok(false) => {
                self.forget(me, id);
                return Err(LockError::Timeout(id.to_string()));
            }
            Err(err) => {
                self.forget(me, id);
                return Err(err);
            }
        }

        let waited = started.elapsed();
        if let Some(holder) = self.table().holders.get_mut(&me) {
            holder.since = Some(Instant::now());
        }
        self.locks_acquired.fetch_add(1, Ordering::Relaxed);
        self.waited_ns.fetch_add(as_nanos(waited), Ordering::Relaxed);
        tracing::trace!(lock = id, waited_ms = waited.as_millis() as u64, "lock acquired");
        Ok(())
    }

    /// Release whatever lock the calling thread holds. No-op if it holds none.
    pub fn release(&self) {
        let me = thread::current().id();
        let Some(id) = self.table().holders.get(&me).map(|h| h.id.clone()) else {
            return;
        };

        if let Err(err) = self.backend.release(&id) {
            tracing::warn!(lock = %id, error = %err, "lock backend release failed");
        }

        let since = {
            let mut table = self.table();
            table.owners.remove(&id);
            table.holders.remove(&me).and_then(|h| h.since)
        };
        self.released.notify_all();

        if let Some(since) = since {
            self.held_ns
                .fetch_add(as_nanos(since.elapsed()), Ordering::Relaxed);
        }
        tracing::trace!(lock = %id, "lock released");
    }

    /// Drop a local claim whose backend acquisition failed.
    fn forget(&self, me: ThreadId, id: &str) {
        {
            let mut table = self.table();
            table.owners.remove(id);
            table.holders.remove(&me);
        }
        self.released.notify_all();
    }

    /// Whether `id` is held here or, as far as the backend knows, elsewhere.
    pub fn is_locked(&self, id: &str) -> bool {
        if self.table().owners.contains_key(id) {
            return true;
        }
        match self.backend.is_held(id) {
            Ok(held) => held,
            Err(err) => {
                tracing::warn!(lock = id, error = %err, "lock backend query failed");
                false
            }
        }
    }

    pub fn thread_has_lock(&self) -> bool {
        self.table().holders.contains_key(&thread::current().id())
    }

    pub fn locked_id_for_thread(&self) -> Option<String> {
        self.table()
            .holders
            .get(&thread::current().id())
            .map(|h| h.id.clone())
    }

    /// Total number of successful acquisitions.
    pub fn locks_acquired(&self) -> u64 {
        self.locks_acquired.load(Ordering::Relaxed)
    }

    /// Time spent waiting for locks, summed over all callers.
    pub fn waited_for_locks(&self) -> Duration {
        Duration::from_nanos(self.waited_ns.load(Ordering::Relaxed))
    }

    /// Time locks were held, summed over all holders.
    pub fn locks_held(&self) -> Duration {
        Duration::from_nanos(self.held_ns.load(Ordering::Relaxed))
    }
}

fn as_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

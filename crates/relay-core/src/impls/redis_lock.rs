//! RedisLockBackend - locks stored as Redis keys.
//!
//! Acquire is `SET key token NX PX lease`; the lease makes a crashed holder's
//! lock expire on its own. While a lock is held a watchdog thread extends the
//! lease every third of its length, so a long pipeline run keeps its lock.
//! Release stops the watchdog and deletes the key only if it still carries
//! our token, so an expired-and-retaken lock is never freed by mistake.
//!
//! A dropped connection is reopened on the next command.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use ulid::Ulid;

use crate::lock::LockError;
use crate::ports::LockBackend;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const POLL_JITTER_MS: u64 = 25;

/// A single connection that is reopened after I/O failures.
struct RedisConnection {
    client: redis::Client,
    password: Option<String>,
    connection: Mutex<Option<redis::Connection>>,
}

impl RedisConnection {
    fn open(&self) -> redis::RedisResult<redis::Connection> {
        let mut connection = self.client.get_connection()?;
        if let Some(password) = &self.password {
            redis::cmd("AUTH").arg(password).query::<()>(&mut connection)?;
        }
        Ok(connection)
    }

    fn slot(&self) -> MutexGuard<'_, Option<redis::Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `command`, reconnecting once if the connection turns out dead.
    fn run<T>(
        &self,
        mut command: impl FnMut(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, LockError> {
        let mut slot = self.slot();
        let mut reconnected = false;
        loop {
            let connection = match slot.as_mut() {
                Some(connection) => connection,
                None => {
                    reconnected = true;
                    slot.insert(self.open().map_err(backend_error)?)
                }
            };
            match command(connection) {
                Err(err) if is_connection_error(&err) && !reconnected => {
                    tracing::warn!(error = %err, "redis connection lost, reconnecting");
                    *slot = None;
                }
                Err(err) => {
                    if is_connection_error(&err) {
                        *slot = None;
                    }
                    return Err(backend_error(err));
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

struct HeldLock {
    token: String,
    stop: mpsc::Sender<()>,
    watchdog: JoinHandle<()>,
}

pub struct RedisLockBackend {
    redis: Arc<RedisConnection>,
    key_prefix: String,
    lease: Duration,
    /// Locks this process holds, by lock id.
    held: Mutex<HashMap<String, HeldLock>>,
}

impl RedisLockBackend {
    /// Connect to `address` (e.g. `redis://localhost:6379`).
    ///
    /// The first connection is opened right away so a wrong address fails
    /// at startup.
    pub fn connect(
        address: &str,
        password: Option<&str>,
        key_prefix: &str,
        lease: Duration,
    ) -> Result<Self, LockError> {
        let redis = RedisConnection {
            client: redis::Client::open(address).map_err(backend_error)?,
            password: password
                .filter(|p| !p.trim().is_empty())
                .map(str::to_string),
            connection: Mutex::new(None),
        };
        let connection = redis.open().map_err(backend_error)?;
        *redis.slot() = Some(connection);
        Ok(Self {
            redis: Arc::new(redis),
            key_prefix: key_prefix.to_string(),
            lease,
            held: Mutex::new(HashMap::new()),
        })
    }

    fn key(&self, id: &str) -> String {
        format!("{}::{}", self.key_prefix, id)
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, HeldLock>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lease_ms(&self) -> u64 {
        u64::try_from(self.lease.as_millis()).unwrap_or(u64::MAX)
    }

    fn try_set(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let lease_ms = self.lease_ms();
        let reply: Option<String> = self.redis.run(|connection| {
            redis::cmd("SET")
                .arg(key)
                .arg(token)
                .arg("NX")
                .arg("PX")
                .arg(lease_ms)
                .query(connection)
        })?;
        Ok(reply.is_some())
    }

    fn start_watchdog(&self, id: &str, key: String, token: String) -> HeldLock {
        let (stop, stopped) = mpsc::channel();
        let redis = Arc::clone(&self.redis);
        let lease_ms = self.lease_ms();
        let renew_token = token.clone();
        let lock_id = id.to_string();
        let watchdog = thread::spawn(move || {
            keep_alive(renewal_interval(Duration::from_millis(lease_ms)), &stopped, || {
                let renewed: i64 = redis.run(|connection| {
                    redis::Script::new(RENEW_SCRIPT)
                        .key(&key)
                        .arg(&renew_token)
                        .arg(lease_ms)
                        .invoke(connection)
                })?;
                if renewed == 0 {
                    tracing::error!(lock = %lock_id, "redis lock was lost before it was released");
                }
                Ok(renewed != 0)
            });
        });
        HeldLock {
            token,
            stop,
            watchdog,
        }
    }
}

impl LockBackend for RedisLockBackend {
    fn try_acquire(&self, id: &str, timeout: Duration) -> Result<bool, LockError> {
        let key = self.key(id);
        let token = Ulid::new().to_string();
        let deadline = Instant::now() + timeout;

        loop {
            if self.try_set(&key, &token)? {
                let held = self.start_watchdog(id, key, token);
                self.held().insert(id.to_string(), held);
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=POLL_JITTER_MS));
            thread::sleep((POLL_INTERVAL + jitter).min(remaining));
        }
    }

    fn release(&self, id: &str) -> Result<(), LockError> {
        let Some(held) = self.held().remove(id) else {
            return Ok(());
        };
        drop(held.stop);
        if held.watchdog.join().is_err() {
            tracing::warn!(lock = id, "redis lock watchdog panicked");
        }

        let key = self.key(id);
        let deleted: i64 = self.redis.run(|connection| {
            redis::Script::new(RELEASE_SCRIPT)
                .key(&key)
                .arg(&held.token)
                .invoke(connection)
        })?;
        if deleted == 0 {
            tracing::warn!(lock = id, "redis lock had already expired before release");
        }
        Ok(())
    }

    fn is_held(&self, id: &str) -> Result<bool, LockError> {
        let key = self.key(id);
        self.redis
            .run(|connection| redis::cmd("EXISTS").arg(&key).query(connection))
    }
}

/// How often a lease is extended: three times per lease, at least every 10ms.
fn renewal_interval(lease: Duration) -> Duration {
    (lease / 3).max(Duration::from_millis(10))
}

/// Call `renew` every `interval` until `stopped` fires or is dropped, or
/// `renew` reports the lock is gone. Renewal errors are logged and retried on
/// the next tick.
fn keep_alive(
    interval: Duration,
    stopped: &mpsc::Receiver<()>,
    mut renew: impl FnMut() -> Result<bool, LockError>,
) {
    loop {
        match stopped.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        match renew() {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => tracing::warn!(error = %err, "redis lock renewal failed"),
        }
    }
}

fn is_connection_error(err: &redis::RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

fn backend_error(err: redis::RedisError) -> LockError {
    LockError::Backend(err.to_string())
}

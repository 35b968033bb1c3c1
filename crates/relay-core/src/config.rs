//! Configuration loaded from YAML.
//!
//! ```yaml
//! connection:
//!   connect_to: localhost:5672
//! processing:
//!   threads: 5
//! routing:
//!   read_from: [first, second]
//!   write_to: out
//!   priorities: { first: 10 }
//!   failure_policies:
//!     first: { retries: 3, dead_letter_wait_ms: 1000 }
//! redis:
//!   address: localhost
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::queue::{DEFAULT_DEAD_LETTER_WAIT, DEFAULT_MAX_RETRIES, FailurePolicy};

const DEFAULT_REDIS_PORT: u16 = 6379;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Broker connection parameters.
///
/// The engine itself never reads these: they are handed to whatever
/// [`Broker`](crate::ports::Broker) client the application builds. They are
/// validated here so every deployment carries a complete broker address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// `host:port` of the broker. Required.
    #[serde(default)]
    pub connect_to: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    #[serde(default = "default_guest")]
    pub username: String,
    #[serde(default = "default_guest")]
    pub password: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_to: String::new(),
            virtual_host: default_virtual_host(),
            username: default_guest(),
            password: default_guest(),
        }
    }
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_guest() -> String {
    "guest".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Worker count (default: 5).
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Retries per message unless a queue overrides it (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_threads() -> usize {
    5
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Exchange the broker client binds the queues to (default: `relay`).
    /// Not used by the engine or the in-memory broker.
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Input queues, one consumer each.
    #[serde(default)]
    pub read_from: Vec<String>,
    /// Route for outgoing messages.
    #[serde(default)]
    pub write_to: Option<String>,
    /// Priority per input queue (default: 0).
    #[serde(default)]
    pub priorities: HashMap<String, i32>,
    #[serde(default)]
    pub failure_policies: HashMap<String, FailurePolicyConfig>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            read_from: Vec::new(),
            write_to: None,
            priorities: HashMap::new(),
            failure_policies: HashMap::new(),
        }
    }
}

fn default_exchange() -> String {
    "relay".to_string()
}

/// Per-queue overrides, anything left out falls back to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailurePolicyConfig {
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub dead_letter_wait_ms: Option<u64>,
    #[serde(default)]
    pub failed_routing_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Blank or missing means no Redis: locks are process-local.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Upper bound for one lock acquisition (default: 60s).
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    /// Expiry of a lock key, frees locks of crashed holders (default: 5min).
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: None,
            password: None,
            key_prefix: default_key_prefix(),
            lock_wait_ms: default_lock_wait_ms(),
            lease_ms: default_lease_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "relay::lock".to_string()
}

fn default_lock_wait_ms() -> u64 {
    60_000
}

fn default_lease_ms() -> u64 {
    300_000
}

impl RedisConfig {
    /// Address as a full `redis://host:port` url, `None` if unset.
    ///
    /// A missing scheme becomes `redis://`, a missing port `6379`.
    pub fn normalized_address(&self) -> Option<String> {
        let address = self.address.as_deref().map(str::trim)?;
        if address.is_empty() {
            return None;
        }
        let (scheme, rest) = address.split_once("://").unwrap_or(("redis", address));
        let (authority, path) = match rest.find('/') {
            Some(at) => rest.split_at(at),
            None => (rest, ""),
        };
        let host = authority.rsplit('@').next().unwrap_or(authority);
        let has_port = host
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
        if has_port {
            Some(format!("{scheme}://{authority}{path}"))
        } else {
            Some(format!("{scheme}://{authority}:{DEFAULT_REDIS_PORT}{path}"))
        }
    }

    pub fn is_configured(&self) -> bool {
        self.normalized_address().is_some()
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.connect_to.trim().is_empty() {
            return Err(ConfigError::Missing("connection.connect_to"));
        }
        if self.routing.read_from.is_empty() {
            return Err(ConfigError::Missing("routing.read_from"));
        }
        if let Some(queue) = self.routing.read_from.iter().find(|q| q.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "routing.read_from contains a blank queue name: {queue:?}"
            )));
        }
        if self.processing.threads == 0 {
            return Err(ConfigError::Invalid(
                "processing.threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Failure policy of `queue`: queue overrides, then processing defaults.
    pub fn failure_policy(&self, queue: &str) -> FailurePolicy {
        let overrides = self.routing.failure_policies.get(queue);
        let mut policy = FailurePolicy::new(queue)
            .with_max_retries(
                overrides
                    .and_then(|o| o.retries)
                    .unwrap_or(self.processing.max_retries),
            )
            .with_dead_letter_wait(
                overrides
                    .and_then(|o| o.dead_letter_wait_ms)
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_DEAD_LETTER_WAIT),
            );
        if let Some(key) = overrides.and_then(|o| o.failed_routing_key.as_deref()) {
            policy = policy.with_failed_routing_key(key);
        }
        policy
    }

    pub fn priority(&self, queue: &str) -> i32 {
        self.routing.priorities.get(queue).copied().unwrap_or(0)
    }
}

//! Message model: the unit of work moved from the broker through the engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Broker-side handle of one delivery. Only meaningful to the broker that issued it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delivery-{}", self.0)
    }
}

/// Mutable per-message metadata.
///
/// `source` and `retries` travel with the message across hops; the delivery tag
/// and the raw body only describe the current delivery and are never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    source: String,

    #[serde(skip)]
    delivery_tag: DeliveryTag,

    #[serde(default)]
    retries: u32,

    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,

    #[serde(skip)]
    body: Option<String>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            source: String::new(),
            delivery_tag: DeliveryTag::default(),
            retries: 0,
            timestamp: Utc::now(),
            body: None,
        }
    }
}

impl Envelope {
    /// Input queue this message was read from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    /// Number of failed attempts so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Raw payload as received, kept for failure reports.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Record where the current delivery came from.
    pub(crate) fn stamp_delivery(&mut self, source: &str, tag: DeliveryTag, body: &[u8]) {
        self.source = source.to_string();
        self.delivery_tag = tag;
        self.body = Some(String::from_utf8_lossy(body).into_owned());
    }

    /// Only the engine counts failures.
    pub(crate) fn increment_retries(&mut self) -> u32 {
        self.retries = self.retries.saturating_add(1);
        self.retries
    }
}

/// A message the engine can receive, process and republish.
///
/// Implementors own an [`Envelope`]; everything else is application data.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct IndexDocument {
///     id: String,
///     tracing_id: Option<String>,
///     #[serde(default)]
///     envelope: Envelope,
///     path: String,
/// }
///
/// impl Message for IndexDocument { /* accessors */ }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable business identifier.
    fn id(&self) -> &str;

    /// Correlation id carried across pipeline hops.
    fn tracing_id(&self) -> Option<&str>;

    fn set_tracing_id(&mut self, tracing_id: Option<String>);

    fn envelope(&self) -> &Envelope;

    fn envelope_mut(&mut self) -> &mut Envelope;
}

/// General purpose message with a free-form JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultMessage {
    #[serde(default = "generate_id")]
    id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    tracing_id: Option<String>,

    #[serde(default)]
    envelope: Envelope,

    #[serde(default)]
    payload: serde_json::Value,
}

fn generate_id() -> String {
    Ulid::new().to_string()
}

impl DefaultMessage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracing_id: None,
            envelope: Envelope::default(),
            payload: serde_json::Value::Null,
        }
    }

    /// Message with a generated ULID as id.
    pub fn generated() -> Self {
        Self::new(generate_id())
    }

    pub fn with_tracing_id(mut self, tracing_id: impl Into<String>) -> Self {
        self.tracing_id = Some(tracing_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

impl Message for DefaultMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracing_id(&self) -> Option<&str> {
        self.tracing_id.as_deref()
    }

    fn set_tracing_id(&mut self, tracing_id: Option<String>) {
        self.tracing_id = tracing_id;
    }

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }
}

//! MessageCodec port - bytes <-> message conversion.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("could not deserialize message: {0}")]
    Deserialize(String),

    #[error("could not serialize message: {0}")]
    Serialize(String),
}

/// Converts raw broker payloads into messages of a concrete type and back.
///
/// A `Deserialize` error marks the delivery as a poison message: it is dropped
/// and never retried.
pub trait MessageCodec<M>: Send + Sync {
    fn deserialize(&self, bytes: &[u8]) -> Result<M, CodecError>;

    fn serialize(&self, message: &M) -> Result<Vec<u8>, CodecError>;
}

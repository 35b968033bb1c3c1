//! JsonCodec - serde_json wire format for any [`Message`].

use crate::domain::Message;
use crate::ports::{CodecError, MessageCodec};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<M: Message> MessageCodec<M> for JsonCodec {
    fn deserialize(&self, bytes: &[u8]) -> Result<M, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
    }

    fn serialize(&self, message: &M) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(message).map_err(|e| CodecError::Serialize(e.to_string()))
    }
}

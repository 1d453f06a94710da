//! Message encodings for queue storage.

use bytes::Bytes;
use relay_protocol::EventMessage;

use super::{QueueError, QueueResult};

/// Turns event messages into bytes for storage and back.
pub trait QueueCodec: Send + Sync {
    fn encode(&self, message: &EventMessage) -> QueueResult<Bytes>;
    fn decode(&self, bytes: &[u8]) -> QueueResult<EventMessage>;
}

/// JSON encoding of the full envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl QueueCodec for JsonCodec {
    fn encode(&self, message: &EventMessage) -> QueueResult<Bytes> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| QueueError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> QueueResult<EventMessage> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_rejects_garbage() {
        let err = JsonCodec.decode(b"not json").unwrap_err();
        assert!(matches!(err, QueueError::Codec(_)));
    }

    #[test]
    fn test_encoded_form_is_plain_json() {
        let bytes = JsonCodec
            .encode(&EventMessage::new("values", json!({"count": 2})))
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"event": "values", "data": {"count": 2}}));
    }
}

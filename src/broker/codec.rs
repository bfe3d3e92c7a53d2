//! Envelope encoding.

use super::{BrokerError, Envelope, Result};

/// Converts envelopes to and from wire bytes.
pub trait Codec: Send + Sync {
    fn marshal(&self, envelope: &Envelope) -> Result<Vec<u8>>;

    fn unmarshal(&self, bytes: &[u8]) -> Result<Envelope>;

    fn name(&self) -> &'static str;
}

/// JSON codec: `{"Header": {...}, "Body": "<base64>"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn marshal(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(|e| BrokerError::Codec(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Envelope> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::Codec(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// Look up a built-in codec by name.
pub fn codec_by_name(name: &str) -> Option<std::sync::Arc<dyn Codec>> {
    match name {
        "json" => Some(std::sync::Arc::new(JsonCodec)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let envelope = Envelope::new(vec![0u8, 159, 146, 150]).with_header("Id", "1");
        let bytes = JsonCodec.marshal(&envelope).unwrap();

        assert_eq!(JsonCodec.unmarshal(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_json_unmarshal_garbage() {
        let result = JsonCodec.unmarshal(b"not json");
        assert!(matches!(result, Err(BrokerError::Codec(_))));
    }

    #[test]
    fn test_codec_by_name() {
        assert_eq!(codec_by_name("json").map(|c| c.name()), Some("json"));
        assert!(codec_by_name("protobuf").is_none());
    }
}

//! Generic message envelope carried through the broker.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A message: string headers plus an opaque body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Header", default)]
    pub header: HashMap<String, String>,
    #[serde(rename = "Body", default, with = "base64_body")]
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }
}

/// Bodies travel as base64 strings in JSON, matching how byte slices are
/// encoded by other clients on the same topics.
mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers() {
        let envelope = Envelope::new("x")
            .with_header("Content-Type", "text/plain")
            .with_header("Id", "42");

        assert_eq!(envelope.header("Id"), Some("42"));
        assert_eq!(envelope.header("Missing"), None);
        assert_eq!(envelope.body, b"x");
    }

    #[test]
    fn test_json_shape() {
        let envelope = Envelope::new("hello").with_header("k", "v");
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["Header"]["k"], "v");
        assert_eq!(json["Body"], "aGVsbG8=");
    }

    #[test]
    fn test_missing_fields_decode_empty() {
        let envelope: Envelope = serde_json::from_str(r#"{"Body":null}"#).unwrap();
        assert!(envelope.body.is_empty());

        let envelope: Envelope = serde_json::from_str("{}").unwrap();
        assert_eq!(envelope, Envelope::default());
    }
}

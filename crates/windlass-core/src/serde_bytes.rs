//! Serde support for payload bytes as base64 strings.
//!
//! Serialized payloads are raw bytes with a 4-byte format tag; when a record
//! containing one travels as JSON (API responses, queue messages) the bytes
//! are carried as standard base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{de, Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    STANDARD.decode(s.as_bytes()).map_err(de::Error::custom)
}

/// Variant for `Option<Vec<u8>>` fields.
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| STANDARD.decode(s.as_bytes()).map_err(de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        #[serde(with = "crate::serde_bytes")]
        data: Vec<u8>,
        #[serde(default, with = "crate::serde_bytes::option")]
        extra: Option<Vec<u8>>,
    }

    #[test]
    fn roundtrip() {
        let payload = Payload {
            data: vec![0, 1, 2, 254, 255],
            extra: Some(b"devl{}".to_vec()),
        };
        let json = serde_json::to_string(&payload).expect("serialize");
        let parsed: Payload = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, payload);
    }

    #[test]
    fn none_roundtrip() {
        let payload = Payload {
            data: vec![],
            extra: None,
        };
        let json = serde_json::to_string(&payload).expect("serialize");
        let parsed: Payload = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, payload);
    }
}

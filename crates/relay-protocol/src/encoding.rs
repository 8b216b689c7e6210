//! Downstream item encodings.
//!
//! Browsers consuming the relay expect each item as a JSON text frame holding
//! the upstream record verbatim. Native clients can opt into named
//! MessagePack, delivered as binary frames.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::codec::ProtocolError;

/// Encoding used for items pushed to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// UTF-8 JSON, sent as text frames.
    #[default]
    Json,
    /// Named MessagePack, sent as binary frames.
    Msgpack,
}

/// An encoded item, ready for a WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// Text frame payload.
    Text(String),
    /// Binary frame payload.
    Binary(Bytes),
}

impl Encoded {
    /// Size of the encoded payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(text) => text.len(),
            Encoded::Binary(data) => data.len(),
        }
    }

    /// Check if the encoded payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Encoding {
    /// Encode a record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(self, record: &Value) -> Result<Encoded, ProtocolError> {
        match self {
            Encoding::Json => Ok(Encoded::Text(serde_json::to_string(record)?)),
            Encoding::Msgpack => Ok(Encoded::Binary(Bytes::from(rmp_serde::to_vec_named(
                record,
            )?))),
        }
    }

    /// Name used in configuration.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Msgpack => "msgpack",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "msgpack" | "messagepack" => Ok(Encoding::Msgpack),
            _ => Err("Unknown encoding"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_matches_compact_serialization() {
        let record = json!({"id_str": "42", "text": "hello #codemash"});
        let encoded = Encoding::Json.encode(&record).unwrap();
        assert_eq!(
            encoded,
            Encoded::Text(r##"{"id_str":"42","text":"hello #codemash"}"##.to_string())
        );
    }

    #[test]
    fn test_msgpack_is_binary() {
        let record = json!({"id": 7});
        let encoded = Encoding::Msgpack.encode(&record).unwrap();
        let Encoded::Binary(data) = encoded else {
            panic!("Expected binary payload");
        };
        let decoded: Value = rmp_serde::from_slice(&data).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("json".parse::<Encoding>(), Ok(Encoding::Json));
        assert_eq!("MsgPack".parse::<Encoding>(), Ok(Encoding::Msgpack));
        assert!("xml".parse::<Encoding>().is_err());
        assert_eq!(Encoding::default(), Encoding::Json);
    }
}

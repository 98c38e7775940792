//! JSON shapes for HTTP exchanges carried through the tunnel.
//!
//! Bodies are raw bytes, serialized as base64 strings and omitted when
//! empty. Headers keep a single value per key: when the source carries a
//! multi-valued header, the first value wins, in both directions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The serialised form of an HTTP request sent relay → agent.
///
/// `url` is the path plus query exactly as received by the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelledRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
}

/// The serialised form of an HTTP response sent agent → relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelledResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
}

impl TunnelledResponse {
    /// A plain-text response synthesized on the agent when the backend
    /// cannot be reached or the request cannot be decoded.
    pub fn error(status_code: u16, message: &str) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        Self {
            status_code,
            headers,
            body: message.as_bytes().to_vec(),
        }
    }
}

/// Serde helper for Vec<u8> ↔ base64 string.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

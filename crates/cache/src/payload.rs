//! Queue member encoding
//!
//! A stored member is `<uuid>:<prefix>:<body>`. JSON-serializable payloads
//! use the `j` prefix with the JSON text as body; anything else falls back
//! to base64-encoded raw bytes under the `b` prefix. The random uuid keeps
//! two byte-identical payloads distinct, since a sorted set would otherwise
//! collapse them into one member.

use crate::CacheError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use uuid::Uuid;

/// Prefix for JSON-encoded payloads
pub const PAYLOAD_JSON_PREFIX: &str = "j";
/// Prefix for the binary fallback
pub const PAYLOAD_BINARY_PREFIX: &str = "b";

/// A queue payload: structured JSON or opaque bytes
#[derive(Debug, Clone, PartialEq)]
pub enum QueuePayload {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl QueuePayload {
    /// Encode with a fresh unique id, producing the stored member string
    pub fn encode(&self) -> String {
        self.encode_with_id(&Uuid::new_v4().to_string())
    }

    /// Encode under a caller-supplied id (stable across re-appends)
    pub fn encode_with_id(&self, id: &str) -> String {
        match self {
            QueuePayload::Json(value) => {
                format!("{id}:{PAYLOAD_JSON_PREFIX}:{value}")
            }
            QueuePayload::Bytes(bytes) => {
                format!("{id}:{PAYLOAD_BINARY_PREFIX}:{}", BASE64.encode(bytes))
            }
        }
    }

    /// Decode a stored member into `(id, payload)`
    pub fn decode(member: &str) -> Result<(String, QueuePayload), CacheError> {
        let mut parts = member.splitn(3, ':');
        let id = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CacheError::Encoding(format!("member missing id: {member:.64}")))?;
        let prefix = parts
            .next()
            .ok_or_else(|| CacheError::Encoding(format!("member missing prefix: {member:.64}")))?;
        let body = parts
            .next()
            .ok_or_else(|| CacheError::Encoding(format!("member missing body: {member:.64}")))?;

        let payload = match prefix {
            PAYLOAD_JSON_PREFIX => QueuePayload::Json(
                serde_json::from_str(body)
                    .map_err(|e| CacheError::Encoding(format!("invalid json payload: {e}")))?,
            ),
            PAYLOAD_BINARY_PREFIX => QueuePayload::Bytes(
                BASE64
                    .decode(body)
                    .map_err(|e| CacheError::Encoding(format!("invalid base64 payload: {e}")))?,
            ),
            other => {
                return Err(CacheError::Encoding(format!(
                    "unknown payload prefix: {other}"
                )))
            }
        };

        Ok((id.to_string(), payload))
    }

    /// The JSON value, if this is a JSON payload
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            QueuePayload::Json(v) => Some(v),
            QueuePayload::Bytes(_) => None,
        }
    }
}

impl From<serde_json::Value> for QueuePayload {
    fn from(value: serde_json::Value) -> Self {
        QueuePayload::Json(value)
    }
}

impl From<Vec<u8>> for QueuePayload {
    fn from(bytes: Vec<u8>) -> Self {
        QueuePayload::Bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip() {
        let payload = QueuePayload::Json(json!({
            "message_id": "m1",
            "content": "hello 世界",
            "refer_list": ["m0"],
        }));
        let member = payload.encode();
        let (id, decoded) = QueuePayload::decode(&member).unwrap();
        assert!(!id.is_empty());
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_binary_round_trip() {
        let payload = QueuePayload::Bytes(vec![0, 1, 2, 255, 254]);
        let member = payload.encode_with_id("fixed-id");
        assert!(member.starts_with("fixed-id:b:"));
        let (id, decoded) = QueuePayload::decode(&member).unwrap();
        assert_eq!(id, "fixed-id");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_identical_payloads_get_distinct_members() {
        let payload = QueuePayload::Json(json!("same"));
        assert_ne!(payload.encode(), payload.encode());
    }

    #[test]
    fn test_json_body_with_colons_survives() {
        let payload = QueuePayload::Json(json!({"url": "https://example.com:8443/a"}));
        let member = payload.encode();
        let (_, decoded) = QueuePayload::decode(&member).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_malformed_members_rejected() {
        assert!(QueuePayload::decode("").is_err());
        assert!(QueuePayload::decode("no-prefix").is_err());
        assert!(QueuePayload::decode("id:x:body").is_err());
        assert!(QueuePayload::decode("id:j:{not json").is_err());
        assert!(QueuePayload::decode("id:b:!!!").is_err());
    }
}

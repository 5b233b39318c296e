use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form header fields: dependencies, targets, retry budget, status.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Wire-format envelope exchanged between clients, controller units and engines.
///
/// The controller never looks inside `payload`; scheduling decisions are
/// made from `msg_type` and `metadata` alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Kind of message, e.g. `apply_request`, `registration_reply`.
    pub msg_type: String,

    /// Unique id of this message; tasks are identified by the id of their request.
    pub msg_id: Uuid,

    /// For replies, the `msg_id` of the request being answered.
    #[serde(default)]
    pub parent_id: Option<Uuid>,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub metadata: Metadata,

    /// MessagePack-encoded payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    /// Schema version for forward-compatible evolution.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Message {
    /// Create a new message, serializing the payload with MessagePack.
    pub fn new<T: Serialize>(
        msg_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            msg_type: msg_type.into(),
            msg_id: Uuid::new_v4(),
            parent_id: None,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            payload: rmp_serde::to_vec(payload)?,
            version: 1,
        })
    }

    /// Create a message carrying already-encoded payload bytes.
    pub fn raw(msg_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            msg_type: msg_type.into(),
            msg_id: Uuid::new_v4(),
            parent_id: None,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            payload,
            version: 1,
        }
    }

    /// Create a reply whose `parent_id` points at `parent`.
    pub fn reply_to<T: Serialize>(
        parent: &Message,
        msg_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        let mut msg = Self::new(msg_type, payload)?;
        msg.parent_id = Some(parent.msg_id);
        Ok(msg)
    }

    /// Builder-style metadata insert.
    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key).filter(|v| !v.is_null())
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta(key).and_then(|v| v.as_str())
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.payload)
    }

    /// Serialize this entire message envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize a message envelope from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Helper module for serde to handle `Vec<u8>` as raw bytes in MessagePack.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_survives_msgpack_with_metadata() {
        let msg = Message::new("apply_request", &"payload".to_string())
            .unwrap()
            .with_meta("retries", 2)
            .with_meta("after", serde_json::json!(["a", "b"]));
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.msg_type, "apply_request");
        assert_eq!(decoded.msg_id, msg.msg_id);
        assert_eq!(decoded.meta("retries").and_then(|v| v.as_u64()), Some(2));
        assert_eq!(decoded.metadata["after"], serde_json::json!(["a", "b"]));
        assert_eq!(decoded.decode::<String>().unwrap(), "payload");
    }

    #[test]
    fn reply_points_at_parent() {
        let req = Message::new("queue_request", &()).unwrap();
        let reply = Message::reply_to(&req, "queue_reply", &true).unwrap();
        assert_eq!(reply.parent_id, Some(req.msg_id));
        assert_ne!(reply.msg_id, req.msg_id);
    }

    #[test]
    fn null_metadata_reads_as_absent() {
        let msg = Message::raw("x", vec![]).with_meta("timeout", serde_json::Value::Null);
        assert!(msg.meta("timeout").is_none());
    }
}

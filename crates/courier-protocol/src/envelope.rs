//! The JSON envelope shared by client frames and bus payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::event::EventKind;

/// A user identifier, resolved by the external authentication layer.
pub type UserId = i64;

/// Current time as unix seconds.
#[must_use]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// A wire envelope.
///
/// The shape is stable in both directions:
/// `event` names the kind, `data` is an opaque payload, `msg_id` is an
/// optional correlation id and `timestamp` is unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event kind name.
    pub event: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    /// Optional message identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    /// Creation time in unix seconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    #[must_use]
    pub fn new(event: impl Into<EventKind>, data: Value) -> Self {
        Self {
            event: event.into().as_str().to_string(),
            data,
            msg_id: None,
            timestamp: unix_timestamp(),
        }
    }

    /// Attach a message identifier.
    #[must_use]
    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = Some(msg_id.into());
        self
    }

    /// The parsed event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        EventKind::from(self.event.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_json_shape() {
        let envelope = Envelope {
            event: "message".into(),
            data: json!({"content": "hi"}),
            msg_id: None,
            timestamp: 1_700_000_000,
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({"event": "message", "data": {"content": "hi"}, "timestamp": 1_700_000_000})
        );
    }

    #[test]
    fn test_envelope_msg_id_serialized_when_present() {
        let envelope = Envelope::new(EventKind::Pong, Value::Null).with_msg_id("m-1");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["msg_id"], "m-1");
        assert_eq!(value["event"], "pong");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_envelope_missing_fields_default() {
        let envelope: Envelope = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(envelope.kind(), EventKind::Ping);
        assert_eq!(envelope.data, Value::Null);
        assert_eq!(envelope.timestamp, 0);
    }
}

//! Event kinds and their typed payloads.
//!
//! [`EventKind`] is the discriminant carried in [`Envelope::event`];
//! [`Event`] is the decoded, typed view of an envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::codec::ProtocolError;
use crate::envelope::{Envelope, UserId};

/// Event kind identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ping,
    Pong,
    Message,
    GroupMessage,
    MessageRead,
    FriendOnline,
    FriendOffline,
    /// Any kind this core does not interpret.
    Other(String),
}

impl EventKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Ping => "ping",
            EventKind::Pong => "pong",
            EventKind::Message => "message",
            EventKind::GroupMessage => "group_message",
            EventKind::MessageRead => "message_read",
            EventKind::FriendOnline => "friend_online",
            EventKind::FriendOffline => "friend_offline",
            EventKind::Other(name) => name,
        }
    }

    /// Whether this kind is interpreted by the core.
    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Other(_))
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        match value {
            "ping" => EventKind::Ping,
            "pong" => EventKind::Pong,
            "message" => EventKind::Message,
            "group_message" => EventKind::GroupMessage,
            "message_read" => EventKind::MessageRead,
            "friend_online" => EventKind::FriendOnline,
            "friend_offline" => EventKind::FriendOffline,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        EventKind::from(value.as_str())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `message` and `group_message` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEventData {
    /// Persisted message id.
    #[serde(default)]
    pub id: i64,
    /// Sender.
    pub from_user_id: UserId,
    /// Recipient for direct messages (0 for group messages).
    #[serde(default)]
    pub to_user_id: UserId,
    /// Target group (0 for direct messages).
    #[serde(default)]
    pub group_id: i64,
    /// Application-defined content type.
    #[serde(default)]
    pub msg_type: i8,
    /// Message body.
    #[serde(default)]
    pub content: String,
    /// RFC 3339 creation time.
    #[serde(default)]
    pub created_at: String,
}

impl MessageEventData {
    /// Whether the message targets a group.
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.group_id > 0
    }
}

/// Payload of `friend_online` and `friend_offline` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineStatusData {
    pub user_id: UserId,
    pub online: bool,
}

/// A decoded event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Ping,
    Pong,
    Message(MessageEventData),
    GroupMessage(MessageEventData),
    /// Read receipt; the payload shape belongs to the message layer.
    MessageRead(Value),
    FriendOnline(OnlineStatusData),
    FriendOffline(OnlineStatusData),
    /// Unrecognized kind, carried through unexamined.
    Other { event: String, data: Value },
}

impl Event {
    /// Decode the typed view of an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if a known kind carries a payload of the wrong shape.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let kind = envelope.kind();
        let invalid = |source| ProtocolError::InvalidPayload {
            event: kind.to_string(),
            source,
        };

        let event = match &kind {
            EventKind::Ping => Event::Ping,
            EventKind::Pong => Event::Pong,
            EventKind::Message => {
                Event::Message(serde_json::from_value(envelope.data.clone()).map_err(invalid)?)
            }
            EventKind::GroupMessage => Event::GroupMessage(
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?,
            ),
            EventKind::MessageRead => Event::MessageRead(envelope.data.clone()),
            EventKind::FriendOnline => Event::FriendOnline(
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?,
            ),
            EventKind::FriendOffline => Event::FriendOffline(
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?,
            ),
            EventKind::Other(name) => Event::Other {
                event: name.clone(),
                data: envelope.data.clone(),
            },
        };

        Ok(event)
    }

    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Ping => EventKind::Ping,
            Event::Pong => EventKind::Pong,
            Event::Message(_) => EventKind::Message,
            Event::GroupMessage(_) => EventKind::GroupMessage,
            Event::MessageRead(_) => EventKind::MessageRead,
            Event::FriendOnline(_) => EventKind::FriendOnline,
            Event::FriendOffline(_) => EventKind::FriendOffline,
            Event::Other { event, .. } => EventKind::Other(event.clone()),
        }
    }

    /// Build an envelope for this event, stamped now.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn into_envelope(self) -> Result<Envelope, ProtocolError> {
        let kind = self.kind();
        let data = match self {
            Event::Ping | Event::Pong => Value::Null,
            Event::Message(data) | Event::GroupMessage(data) => serde_json::to_value(data)?,
            Event::MessageRead(data) => data,
            Event::FriendOnline(data) | Event::FriendOffline(data) => serde_json::to_value(data)?,
            Event::Other { data, .. } => data,
        };
        Ok(Envelope::new(kind, data))
    }

    /// Presence event for a user going online or offline.
    #[must_use]
    pub fn presence(user_id: UserId, online: bool) -> Self {
        let data = OnlineStatusData { user_id, online };
        if online {
            Event::FriendOnline(data)
        } else {
            Event::FriendOffline(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_names() {
        for name in [
            "ping",
            "pong",
            "message",
            "group_message",
            "message_read",
            "friend_online",
            "friend_offline",
        ] {
            let kind = EventKind::from(name);
            assert!(kind.is_known(), "{name} should be known");
            assert_eq!(kind.as_str(), name);
        }

        let custom = EventKind::from("typing");
        assert_eq!(custom, EventKind::Other("typing".into()));
        assert!(!custom.is_known());
        assert_eq!(custom.to_string(), "typing");
    }

    #[test]
    fn test_decode_direct_message() {
        let envelope = Envelope {
            event: "message".into(),
            data: json!({
                "id": 10,
                "from_user_id": 1,
                "to_user_id": 7,
                "group_id": 0,
                "msg_type": 1,
                "content": "hello",
                "created_at": "2024-01-01T00:00:00Z"
            }),
            msg_id: None,
            timestamp: 0,
        };

        match Event::from_envelope(&envelope).unwrap() {
            Event::Message(data) => {
                assert_eq!(data.to_user_id, 7);
                assert!(!data.is_group());
            }
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_invalid_payload() {
        let envelope = Envelope {
            event: "friend_online".into(),
            data: json!("not an object"),
            msg_id: None,
            timestamp: 0,
        };

        match Event::from_envelope(&envelope) {
            Err(ProtocolError::InvalidPayload { event, .. }) => assert_eq!(event, "friend_online"),
            other => panic!("Expected InvalidPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_passes_through() {
        let envelope = Envelope {
            event: "typing".into(),
            data: json!({"to": 3}),
            msg_id: Some("abc".into()),
            timestamp: 5,
        };

        let event = Event::from_envelope(&envelope).unwrap();
        assert_eq!(
            event,
            Event::Other {
                event: "typing".into(),
                data: json!({"to": 3})
            }
        );
    }

    #[test]
    fn test_presence_event_envelope() {
        let envelope = Event::presence(42, false).into_envelope().unwrap();
        assert_eq!(envelope.event, "friend_offline");
        assert_eq!(envelope.data, json!({"user_id": 42, "online": false}));
    }
}

//! # courier-protocol
//!
//! Wire definitions for the Courier real-time presence and delivery core.
//!
//! Every frame exchanged with a client, and every payload carried over the
//! fanout bus, is a JSON [`Envelope`]:
//!
//! ```text
//! { "event": "message", "data": { ... }, "msg_id": "optional", "timestamp": 1700000000 }
//! ```
//!
//! ## Event Kinds
//!
//! - `ping` / `pong` - Application-level liveness
//! - `message` / `group_message` - Chat delivery
//! - `message_read` - Read receipts
//! - `friend_online` / `friend_offline` - Presence
//!
//! Any other kind is carried through untouched as [`Event::Other`].
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Envelope, EventKind};
//!
//! let envelope = Envelope::new(EventKind::Ping, serde_json::Value::Null);
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.event, "ping");
//! ```

pub mod codec;
pub mod envelope;
pub mod event;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{unix_timestamp, Envelope, UserId};
pub use event::{Event, EventKind, MessageEventData, OnlineStatusData};

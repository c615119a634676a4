//! # courier-core
//!
//! Presence and delivery for the Courier real-time messaging backend.
//!
//! This crate provides:
//!
//! - **Session** - One live connection for one user, with a bounded outbound queue
//! - **Registry** - Authoritative user to session map, one session per user
//! - **Heartbeat** - Periodic eviction of sessions that stopped acknowledging
//! - **Fanout** - Bridge between the local registry and a shared pub/sub bus
//! - **Hub** - Composition of the above for one backend instance
//!
//! The bus is a trait. [`InMemoryBus`] serves a single process; the `redis`
//! feature adds `RedisBus` for fanout across instances.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Connection  │────▶│  Registry   │◀────│  Heartbeat  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            ▲
//!                            │
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │   Fanout    │◀───▶│     Bus     │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod bus;
mod connection;
pub mod directory;
pub mod fanout;
pub mod handler;
pub mod heartbeat;
pub mod hub;
#[cfg(feature = "redis")]
pub mod redis_bus;
pub mod registry;
pub mod session;
pub mod telemetry;

pub use bus::{Bus, BusError, BusMessage, InMemoryBus, Subscription};
pub use directory::{DirectoryError, GroupDirectory, InMemoryGroupDirectory};
pub use fanout::{FanoutBridge, Topics};
pub use handler::{EventHandler, LoggingHandler};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use hub::{Hub, HubConfig};
#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;
pub use registry::{PresenceChange, Registry};
pub use session::{OutboundQueue, SendStatus, Session, SessionConfig, SessionId, SessionState};

//! # courier-transport
//!
//! Transport abstraction layer for Courier sessions.
//!
//! A live connection is split into two independently owned halves:
//!
//! - [`FrameSource`] - read by the session's read flow only
//! - [`FrameSink`] - written by the session's write flow only
//!
//! Adapters are provided for:
//!
//! - **axum** WebSocket upgrades (feature `axum`)
//! - **tokio-tungstenite** streams (feature `websocket`), for embedders with
//!   their own listener and for client connections
//! - an **in-memory** pair used by tests and embedded clients
//!
//! ```rust,ignore
//! use courier_transport::{FrameSource, Inbound};
//!
//! async fn drain(mut source: Box<dyn FrameSource>) {
//!     while let Ok(Some(frame)) = source.recv().await {
//!         if let Inbound::Text(text) = frame {
//!             // Process frame
//!         }
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "axum")]
pub mod axum_ws;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{BoxedSink, BoxedSource, FrameSink, FrameSource, Inbound, TransportError};

//! Transport abstraction traits for Courier.
//!
//! A connection is consumed as two halves so that reading and writing can
//! proceed from different tasks without sharing a lock.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation did not complete in time.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// UTF-8 application frame.
    Text(String),
    /// Binary application frame.
    Binary(Bytes),
    /// Transport-level ping.
    Ping(Bytes),
    /// Transport-level pong, the acknowledgment of our liveness probe.
    Pong(Bytes),
    /// Peer initiated close.
    Close,
}

/// The receiving half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` once the stream has ended.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;
}

/// The sending half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send an encoded application frame as text.
    async fn send_text(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Send a transport-level liveness probe.
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Boxed receiving half.
pub type BoxedSource = Box<dyn FrameSource>;

/// Boxed sending half.
pub type BoxedSink = Box<dyn FrameSink>;

/// Interpret outbound bytes as UTF-8 text.
///
/// Encoded envelopes are always JSON, so this only fails on a caller bug.
pub(crate) fn into_text(data: Bytes) -> Result<String, TransportError> {
    String::from_utf8(data.to_vec()).map_err(|e| TransportError::SendFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_text() {
        assert_eq!(into_text(Bytes::from_static(b"{}")).unwrap(), "{}");
        assert!(into_text(Bytes::from_static(&[0xff, 0xfe])).is_err());
    }
}

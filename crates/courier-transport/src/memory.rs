//! In-process transport.
//!
//! [`pair`] returns the two halves a session consumes plus a [`Peer`] handle
//! standing in for the remote client. Dropping the peer makes every further
//! write fail, which is how a vanished client looks to the write flow.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{into_text, FrameSink, FrameSource, Inbound, TransportError};

/// A frame written by the local side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

/// Sending half of an in-memory connection.
pub struct MemorySink {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: bool,
}

/// Receiving half of an in-memory connection.
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

/// The remote end of an in-memory connection.
pub struct Peer {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

/// Create a connected sink/source pair and the peer that drives it.
#[must_use]
pub fn pair() -> (MemorySink, MemorySource, Peer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    (
        MemorySink {
            tx: out_tx,
            closed: false,
        },
        MemorySource { rx: in_rx },
        Peer {
            inbound: Some(in_tx),
            outbound: out_rx,
        },
    )
}

impl Peer {
    /// Deliver a frame to the local source.
    ///
    /// Returns `false` if the local side has dropped its source.
    pub fn send(&self, frame: Inbound) -> bool {
        self.inbound
            .as_ref()
            .map(|tx| tx.send(frame).is_ok())
            .unwrap_or(false)
    }

    /// Deliver a text frame to the local source.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Inbound::Text(text.into()))
    }

    /// End the inbound stream, as a client disconnect would.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Wait for the next frame written by the local side.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Take the next written frame without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, data: Bytes) -> Result<(), TransportError> {
        let text = into_text(data)?;
        self.write(Outbound::Text(text))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.write(Outbound::Ping)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The peer may already be gone
        let _ = self.tx.send(Outbound::Close);
        Ok(())
    }
}

impl MemorySink {
    fn write(&mut self, frame: Outbound) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_exchange() {
        let (mut sink, mut source, mut peer) = pair();

        assert!(peer.send_text("hello"));
        assert_eq!(
            source.recv().await.unwrap(),
            Some(Inbound::Text("hello".into()))
        );

        sink.send_text(Bytes::from_static(b"world")).await.unwrap();
        sink.send_ping().await.unwrap();
        assert_eq!(peer.recv().await, Some(Outbound::Text("world".into())));
        assert_eq!(peer.try_recv(), Some(Outbound::Ping));
    }

    #[tokio::test]
    async fn test_memory_hang_up_ends_stream() {
        let (_sink, mut source, mut peer) = pair();
        peer.hang_up();
        assert_eq!(source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_write_after_peer_drop_fails() {
        let (mut sink, _source, peer) = pair();
        drop(peer);

        assert!(matches!(
            sink.send_ping().await,
            Err(TransportError::ConnectionClosed)
        ));
        // Closing an orphaned sink is still fine
        assert!(sink.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_close_once() {
        let (mut sink, _source, mut peer) = pair();
        sink.close().await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(peer.try_recv(), Some(Outbound::Close));
        assert_eq!(peer.try_recv(), None);
        assert!(sink.send_ping().await.is_err());
    }
}

//! Adapters for WebSockets upgraded through axum.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::trace;

use crate::traits::{into_text, FrameSink, FrameSource, Inbound, TransportError};

/// Sending half of an upgraded axum WebSocket.
pub struct AxumSink {
    inner: SplitSink<WebSocket, Message>,
}

/// Receiving half of an upgraded axum WebSocket.
pub struct AxumSource {
    inner: SplitStream<WebSocket>,
}

/// Split an upgraded socket into sink and source halves.
#[must_use]
pub fn split(socket: WebSocket) -> (AxumSink, AxumSource) {
    let (inner_sink, inner_source) = socket.split();
    (
        AxumSink { inner: inner_sink },
        AxumSource {
            inner: inner_source,
        },
    )
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        let frame = match self.inner.next().await {
            Some(Ok(Message::Text(text))) => Inbound::Text(text),
            Some(Ok(Message::Binary(data))) => Inbound::Binary(Bytes::from(data)),
            Some(Ok(Message::Ping(data))) => Inbound::Ping(Bytes::from(data)),
            Some(Ok(Message::Pong(data))) => Inbound::Pong(Bytes::from(data)),
            Some(Ok(Message::Close(frame))) => {
                trace!(?frame, "Peer sent close frame");
                Inbound::Close
            }
            Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            None => return Ok(None),
        };
        Ok(Some(frame))
    }
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send_text(&mut self, data: Bytes) -> Result<(), TransportError> {
        let text = into_text(data)?;
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.inner
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // A failed close means the peer is already gone
        if let Err(e) = self.inner.send(Message::Close(None)).await {
            trace!(error = %e, "Close frame not delivered");
        }
        Ok(())
    }
}

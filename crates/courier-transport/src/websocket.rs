//! WebSocket transport implementation.
//!
//! Adapters over a tokio-tungstenite [`WebSocketStream`], split into a sink
//! and a source so the two halves can live in separate tasks.
//!
//! The bundled server accepts connections through axum. This adapter is for
//! embedders that run their own TCP listener, and for client-side streams.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::debug;

use crate::traits::{into_text, FrameSink, FrameSource, Inbound, TransportError};

/// Sending half of a tungstenite WebSocket.
pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Receiving half of a tungstenite WebSocket.
pub struct WsSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Split an established WebSocket into sink and source halves.
pub fn split<S>(stream: WebSocketStream<S>) -> (WsSink<S>, WsSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (inner_sink, inner_source) = stream.split();
    (
        WsSink { inner: inner_sink },
        WsSource {
            inner: inner_source,
        },
    )
}

/// Perform the server-side handshake on a raw TCP stream.
///
/// # Errors
///
/// Returns an error if the peer address is unavailable or the handshake fails.
pub async fn accept(
    stream: TcpStream,
) -> Result<(WsSink<TcpStream>, WsSource<TcpStream>), TransportError> {
    let addr = stream.peer_addr().map_err(TransportError::Io)?;

    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| TransportError::ReceiveFailed(format!("WebSocket handshake failed: {}", e)))?;

    debug!("WebSocket handshake completed with {}", addr);
    Ok(split(ws_stream))
}

#[async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            let frame = match self.inner.next().await {
                Some(Ok(Message::Text(text))) => Inbound::Text(text),
                Some(Ok(Message::Binary(data))) => Inbound::Binary(Bytes::from(data)),
                Some(Ok(Message::Ping(data))) => Inbound::Ping(Bytes::from(data)),
                Some(Ok(Message::Pong(data))) => Inbound::Pong(Bytes::from(data)),
                Some(Ok(Message::Close(_))) => Inbound::Close,
                // Raw frames are never surfaced when reading messages
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(WsError::ConnectionClosed)) | None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            };
            return Ok(Some(frame));
        }
    }
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
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
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(format!("Failed to close: {}", e))),
        }
    }
}

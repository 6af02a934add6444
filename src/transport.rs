//! Transport boundary
//!
//! The connection driver owns exactly one transport at a time and sees it
//! through the [`Transport`] trait: a blocking-write primitive, a close
//! primitive, and a stream of events. [`Connector`] produces a fresh
//! transport per connection attempt; a completed `connect` is the "open"
//! event. The production implementation is a binary-mode WebSocket via
//! tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::StreamError;

/// Events a connected transport can produce.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete inbound binary frame.
    Message(Vec<u8>),
    /// The connection closed (remote close frame or end of stream).
    Closed,
    /// The connection failed.
    Failed(StreamError),
}

#[async_trait]
pub trait Transport: Send {
    /// Write one binary frame, resolving once the transport accepted it.
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), StreamError>;

    /// Next inbound event. After `Closed` or `Failed` the transport is
    /// spent.
    async fn next_event(&mut self) -> TransportEvent;

    /// Ask the transport to close. Best effort; errors are swallowed.
    async fn close(&mut self);
}

/// Creates one transport per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport + 'static;

    async fn connect(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<Self::Transport, StreamError>;
}

/// WebSocket transport over a (possibly TLS) TCP stream.
pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), StreamError> {
        self.inner
            .send(Message::Binary(frame))
            .await
            .map_err(|e| StreamError::Connection(format!("WebSocket write failed: {}", e)))
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Binary(data))) => return TransportEvent::Message(data),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket closed by remote");
                    return TransportEvent::Closed;
                }
                // Pongs are produced by tungstenite automatically; text and
                // other frames are outside the binary protocol and skipped.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return TransportEvent::Failed(StreamError::Connection(format!(
                        "WebSocket error: {}",
                        e
                    )))
                }
                None => return TransportEvent::Closed,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// Default connector: WebSocket with upgrade headers and an optional bearer
/// credential.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<WsTransport, StreamError> {
        let mut builder = Request::builder()
            .uri(url)
            .header("Host", url.split("//").last().unwrap_or("localhost"))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            );

        if let Some(token) = bearer_token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }

        let request = builder
            .body(())
            .map_err(|e| StreamError::Connection(format!("Failed to build request: {}", e)))?;

        let (ws, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| StreamError::Connection(format!("WebSocket connect failed: {}", e)))?;

        Ok(WsTransport { inner: ws })
    }
}

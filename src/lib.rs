//! Tether - Reconnecting bidirectional message stream
//!
//! A single logical send/receive stream over a WebSocket connection that
//! survives connection failures during establishment. Messages sent before
//! the connection opens are queued and flushed in order; failed connection
//! attempts are retried with exponential backoff and jitter up to a
//! configured budget.
//!
//! ## Lifecycle
//!
//! ```text
//! NEW -> CONNECTING -> CONNECTED -> CLOSING -> CLOSED
//!             ^   |
//!             +---+  (retry with backoff, CONNECTING only)
//! ```
//!
//! The state machine is monotonic: once CONNECTED, a dropped connection is
//! terminal rather than retried, and a fresh stream must be opened.
//!
//! ## Usage
//!
//! ```no_run
//! use tether::{BidiStream, MsgPackCodec, StreamOptions, WsConnector};
//!
//! # #[derive(serde::Serialize)] struct Request;
//! # #[derive(serde::Deserialize)] struct Response;
//! # async fn run() -> Result<(), tether::StreamError> {
//! let options = StreamOptions::new("wss://example.com/stream");
//! let mut stream: BidiStream<Request, Response> =
//!     BidiStream::connect(WsConnector, MsgPackCodec::new(), options);
//!
//! let mut responses = stream.take_responses().ok_or(tether::StreamError::Closed)?;
//! stream.send(Request).await?;
//! while let Some(msg) = responses.next().await {
//!     let _msg: Response = msg?;
//! }
//! stream.complete().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod codec;
pub mod config;
pub mod error;
pub mod inbound;
pub mod queue;
pub mod retry;
pub mod state;
pub mod stream;
pub mod transport;

pub use codec::{Codec, MsgPackCodec};
pub use config::{RetryConfig, StreamOptions};
pub use error::{Result, StreamError};
pub use inbound::Responses;
pub use state::ConnectionState;
pub use stream::{BidiStream, CompletionHook};
pub use transport::{Connector, Transport, TransportEvent, WsConnector, WsTransport};

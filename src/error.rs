//! Error types for tether

use thiserror::Error;

/// Errors surfaced by a bidirectional stream.
///
/// `Clone` so a terminal failure cause can be handed to every outstanding
/// send completion and replayed to the inbound consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Transport-level failure, before or after the connection opened.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed payload, inbound or outbound.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Send attempted after `complete()`.
    #[error("Cannot send: stream already completed")]
    Completed,

    /// Send or receive attempted after the cancellation handle fired.
    #[error("Cannot send: stream aborted")]
    Aborted,

    /// The retry budget ran out while reconnecting.
    #[error("Max reconnection attempts ({0}) reached")]
    MaxRetriesExceeded(u32),

    /// The stream closed without a more specific failure cause.
    #[error("Stream closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StreamError>;

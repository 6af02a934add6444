//! Stream configuration
//!
//! Immutable options captured at construction.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry tuning for the reconnect strategy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum reconnection attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the backoff delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure.
    pub backoff_factor: f64,
    /// Jitter fraction in [0.0, 1.0]; the actual delay is spread uniformly
    /// within ±jitter/2 around the computed delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

/// Options for one stream instance.
///
/// The cancellation token is an external abrupt-stop signal, active for the
/// whole stream lifetime; graceful shutdown goes through
/// [`BidiStream::complete`](crate::BidiStream::complete) instead.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// WebSocket endpoint, e.g. `ws://localhost:4444`.
    pub url: String,
    /// Optional bearer credential attached as a connection-time header.
    pub bearer_token: Option<String>,
    /// Reconnect tuning.
    pub retry: RetryConfig,
    /// External cancellation handle.
    pub cancel: CancellationToken,
}

impl StreamOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bearer_token: None,
            retry: RetryConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

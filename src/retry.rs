//! Retry coordinator
//!
//! Owns at most one pending reconnect timer and counts attempts against the
//! configured budget. The driver arms the timer with [`schedule`] after a
//! connection failure and awaits [`fired`] in its select loop; multiple
//! failure signals while a timer is pending collapse into one retry.
//!
//! [`schedule`]: RetryCoordinator::schedule
//! [`fired`]: RetryCoordinator::fired

use crate::backoff::Backoff;
use crate::config::RetryConfig;
use std::pin::Pin;
use tokio::time::Sleep;
use tracing::debug;

pub struct RetryCoordinator {
    max_attempts: u32,
    backoff: Backoff,
    attempts_made: u32,
    pending: Option<Pin<Box<Sleep>>>,
}

impl RetryCoordinator {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: Backoff::new(config),
            attempts_made: 0,
            pending: None,
        }
    }

    #[cfg(test)]
    fn with_backoff(config: &RetryConfig, backoff: Backoff) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff,
            attempts_made: 0,
            pending: None,
        }
    }

    /// Arm the retry timer. Idempotent while a timer is already pending.
    /// Returns `false` when the attempt budget is exhausted, in which case
    /// no timer is armed and the caller must give up.
    pub fn schedule(&mut self) -> bool {
        if self.pending.is_some() {
            return true;
        }
        if self.attempts_made >= self.max_attempts {
            return false;
        }
        let delay = self.backoff.next();
        debug!(attempt = self.attempts_made + 1, ?delay, "retry scheduled");
        self.pending = Some(Box::pin(tokio::time::sleep(delay)));
        true
    }

    /// Clear any pending timer without retrying. Used on deliberate
    /// teardown.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Reset the attempt count and backoff delay. Called exactly once per
    /// successful connection so a stream that was stable for a while gets a
    /// fresh retry budget.
    pub fn reset(&mut self) {
        self.attempts_made = 0;
        self.backoff.reset();
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolves when the pending timer fires, clearing it and counting the
    /// attempt. Never resolves while no timer is armed.
    pub async fn fired(&mut self) {
        match self.pending.as_mut() {
            Some(sleep) => {
                sleep.await;
                self.pending = None;
                self.attempts_made += 1;
            }
            None => std::future::pending().await,
        }
    }
}

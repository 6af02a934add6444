//! Exponential backoff with jitter for reconnection delays.

use crate::config::RetryConfig;
use std::time::Duration;

/// Computes successive reconnect delays: exponential growth from
/// `initial_delay`, clamped to `max_delay`, with a uniform multiplicative
/// jitter of ±jitter/2 around the clamped value.
///
/// The only state is the running un-jittered delay; the random draw is
/// injectable so tests can pin it.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    current: Duration,
    rng: Box<dyn FnMut() -> f64 + Send>,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self::with_rng(config, Box::new(rand::random::<f64>))
    }

    /// `rng` must return values in [0.0, 1.0).
    pub fn with_rng(config: &RetryConfig, rng: Box<dyn FnMut() -> f64 + Send>) -> Self {
        Self {
            initial: config.initial_delay,
            max: config.max_delay,
            factor: config.backoff_factor,
            jitter: config.jitter,
            current: config.initial_delay,
            rng,
        }
    }

    /// Next delay. The first call yields `initial_delay`; each subsequent
    /// call multiplies by the backoff factor and clamps to `max_delay`.
    /// Jitter only affects the returned value, never the running delay.
    pub fn next(&mut self) -> Duration {
        let base = self.current;
        let grown = base.mul_f64(self.factor);
        self.current = grown.min(self.max);

        let spread = 1.0 - self.jitter / 2.0 + (self.rng)() * self.jitter;
        base.mul_f64(spread)
    }

    /// Restore the delay to `initial_delay` (on successful connection).
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

//! Connection lifecycle state
//!
//! The state machine only ever advances: once a stream reaches CLOSED it
//! never reopens, which removes any need to reason about resurrecting a
//! finished connection. The ordering check lives in exactly one place,
//! [`StateCell::advance`], so no call site can bypass it.

use tokio::sync::watch;

/// Lifecycle states, totally ordered by declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Single owner of the current state, publishing snapshots over a watch
/// channel for the facade.
pub struct StateCell {
    current: ConnectionState,
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new() -> (Self, watch::Receiver<ConnectionState>) {
        let (tx, rx) = watch::channel(ConnectionState::New);
        (
            Self {
                current: ConnectionState::New,
                tx,
            },
            rx,
        )
    }

    /// Advance to `target`. Moving to a lesser state is a no-op that
    /// returns `false`; equal targets are allowed (a retry attempt while
    /// still CONNECTING is a self-loop).
    pub fn advance(&mut self, target: ConnectionState) -> bool {
        if target < self.current {
            return false;
        }
        self.current = target;
        let _ = self.tx.send(target);
        true
    }

    pub fn get(&self) -> ConnectionState {
        self.current
    }
}

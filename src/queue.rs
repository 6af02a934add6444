//! Outbound send queue
//!
//! An ordered buffer of not-yet-sent messages, each carrying a oneshot
//! completion. The queue owns every entry exclusively until it is either
//! handed to the transport or failed; an entry is settled exactly once.
//! Draining lives in the connection driver, which pops entries strictly in
//! FIFO order whenever the stream is in a sendable state.

use crate::error::StreamError;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// One queued outbound message with its completion signal.
pub struct QueuedMessage<Out> {
    pub payload: Out,
    pub done: oneshot::Sender<Result<(), StreamError>>,
}

impl<Out> QueuedMessage<Out> {
    /// Settle the completion. The caller may already have dropped its
    /// receiver, which is fine.
    pub fn settle(self, result: Result<(), StreamError>) {
        let _ = self.done.send(result);
    }
}

pub struct OutboundQueue<Out> {
    entries: VecDeque<QueuedMessage<Out>>,
}

impl<Out> OutboundQueue<Out> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: QueuedMessage<Out>) {
        self.entries.push_back(entry);
    }

    pub fn pop(&mut self) -> Option<QueuedMessage<Out>> {
        self.entries.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Fail every remaining entry with `error`. Used on terminal closure.
    pub fn fail_all(&mut self, error: &StreamError) {
        while let Some(entry) = self.entries.pop_front() {
            entry.settle(Err(error.clone()));
        }
    }
}

impl<Out> Default for OutboundQueue<Out> {
    fn default() -> Self {
        Self::new()
    }
}

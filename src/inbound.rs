//! Inbound message buffer and pull-based consumer sequence
//!
//! Built on an unbounded mpsc channel: a message arriving while a consumer
//! is awaiting resolves that consumer directly, otherwise it buffers inside
//! the channel. One logical consumer loop is assumed. After the stream
//! ends, the terminal result replays on every further pull.

use crate::error::StreamError;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Driver-side half: delivers messages and, exactly once, the terminal
/// result.
pub(crate) struct ResponseSink<In> {
    tx: mpsc::UnboundedSender<Result<In, StreamError>>,
}

impl<In> ResponseSink<In> {
    /// Hand a message to the consumer, or buffer it if none is waiting.
    /// Returns `false` when the consumer side is gone.
    pub fn deliver(&self, msg: In) -> bool {
        self.tx.send(Ok(msg)).is_ok()
    }

    /// End the sequence with an error; every pending and future pull sees
    /// it.
    pub fn end_with(self, error: StreamError) {
        let _ = self.tx.send(Err(error));
    }

    /// End the sequence cleanly; pulls observe a finished stream.
    pub fn end(self) {}
}

/// The pull-based sequence of inbound messages.
///
/// [`next`](Responses::next) yields messages in transport-arrival order
/// until the stream ends: a clean end yields `None`, a failure yields
/// `Some(Err(..))` and replays the same error on every later call. Also
/// implements [`futures_util::Stream`], which yields the terminal error
/// once and then finishes.
pub struct Responses<In> {
    rx: mpsc::UnboundedReceiver<Result<In, StreamError>>,
    terminal: Option<StreamError>,
    done: bool,
}

impl<In> Responses<In> {
    /// Pull the next message, suspending until one arrives or the stream
    /// ends.
    pub async fn next(&mut self) -> Option<Result<In, StreamError>> {
        if let Some(error) = &self.terminal {
            return Some(Err(error.clone()));
        }
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(msg)) => Some(Ok(msg)),
            Some(Err(error)) => {
                self.terminal = Some(error.clone());
                self.done = true;
                Some(Err(error))
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Pull without suspending. `None` means no buffered message right now.
    pub fn try_next(&mut self) -> Option<Result<In, StreamError>> {
        if let Some(error) = &self.terminal {
            return Some(Err(error.clone()));
        }
        if self.done {
            return None;
        }
        match self.rx.try_recv() {
            Ok(Ok(msg)) => Some(Ok(msg)),
            Ok(Err(error)) => {
                self.terminal = Some(error.clone());
                self.done = true;
                Some(Err(error))
            }
            Err(_) => None,
        }
    }
}

impl<In> Stream for Responses<In> {
    type Item = Result<In, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(msg))) => Poll::Ready(Some(Ok(msg))),
            Poll::Ready(Some(Err(error))) => {
                this.terminal = Some(error.clone());
                this.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) fn channel<In>() -> (ResponseSink<In>, Responses<In>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ResponseSink { tx },
        Responses {
            rx,
            terminal: None,
            done: false,
        },
    )
}

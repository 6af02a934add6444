//! Bidirectional stream facade and connection lifecycle
//!
//! [`BidiStream`] is the public contract: a send/complete handle plus a
//! pull-based sequence of inbound messages. All transport I/O happens in a
//! background driver task that owns the transport exclusively; the facade
//! talks to it over a command channel and oneshot completions.
//!
//! Failures while still CONNECTING are retried with exponential backoff,
//! transparently to the caller, up to the configured budget. Once the
//! stream reaches CONNECTED the state machine never goes back: an
//! unexpected close or transport error after that point is terminal, and
//! surfaces by failing every outstanding send and ending the inbound
//! sequence with the cause. A new stream instance is required to reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::Codec;
use crate::config::StreamOptions;
use crate::error::StreamError;
use crate::inbound::{self, ResponseSink, Responses};
use crate::queue::{OutboundQueue, QueuedMessage};
use crate::retry::RetryCoordinator;
use crate::state::{ConnectionState, StateCell};
use crate::transport::{Connector, Transport, TransportEvent};

/// Optional graceful-shutdown hook, run by `complete()` after the outbound
/// queue drained. It may produce one final message; failure to deliver that
/// message is swallowed, since the remote side may already be gone.
pub type CompletionHook<Out> = Box<dyn FnOnce() -> Option<Out> + Send + 'static>;

enum Command<Out> {
    Send {
        payload: Out,
        done: oneshot::Sender<Result<(), StreamError>>,
    },
    Complete {
        done: oneshot::Sender<()>,
    },
}

/// Reconnecting bidirectional message stream over a single persistent
/// connection.
pub struct BidiStream<Out, In> {
    cmd_tx: mpsc::UnboundedSender<Command<Out>>,
    responses: Option<Responses<In>>,
    completed: AtomicBool,
    cancel: CancellationToken,
    state_rx: watch::Receiver<ConnectionState>,
    terminal: Arc<Mutex<Option<StreamError>>>,
}

impl<Out, In> BidiStream<Out, In>
where
    Out: Send + 'static,
    In: Send + 'static,
{
    /// Open a stream. Connection establishment happens in the background;
    /// messages sent before the connection opens are queued and flushed in
    /// order once it does.
    pub fn connect<C, Cd>(connector: C, codec: Cd, options: StreamOptions) -> Self
    where
        C: Connector,
        Cd: Codec<Out = Out, In = In>,
    {
        Self::connect_with_hook(connector, codec, options, None)
    }

    /// Like [`connect`](Self::connect), with a completion hook run during
    /// graceful shutdown.
    pub fn connect_with_hook<C, Cd>(
        connector: C,
        codec: Cd,
        options: StreamOptions,
        hook: Option<CompletionHook<Out>>,
    ) -> Self
    where
        C: Connector,
        Cd: Codec<Out = Out, In = In>,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (sink, responses) = inbound::channel();
        let (state, state_rx) = StateCell::new();
        let terminal = Arc::new(Mutex::new(None));
        let retry = RetryCoordinator::new(&options.retry);
        let cancel = options.cancel.clone();

        let driver = Driver {
            connector,
            codec,
            url: options.url,
            bearer_token: options.bearer_token,
            cancel: options.cancel,
            cmd_rx,
            sink: Some(sink),
            queue: OutboundQueue::new(),
            retry,
            state,
            terminal: Arc::clone(&terminal),
            completing: None,
            hook,
            owner_gone: false,
        };
        tokio::spawn(driver.run());

        Self {
            cmd_tx,
            responses: Some(responses),
            completed: AtomicBool::new(false),
            cancel,
            state_rx,
            terminal,
        }
    }

    /// Queue a message for delivery, resolving once the transport accepted
    /// it. Fails immediately, without queueing, after `complete()` or
    /// cancellation.
    pub async fn send(&self, payload: Out) -> Result<(), StreamError> {
        if self.completed.load(Ordering::SeqCst) {
            return Err(StreamError::Completed);
        }
        if self.cancel.is_cancelled() {
            return Err(StreamError::Aborted);
        }

        let (done, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { payload, done })
            .map_err(|_| self.terminal_cause())?;

        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.terminal_cause()),
        }
    }

    /// Gracefully finish the outbound side: wait for the send queue to
    /// drain, run the completion hook, then close the connection.
    /// Idempotent, and always resolves.
    pub async fn complete(&self) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (done, done_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Complete { done }).is_err() {
            // Driver already finished; there is nothing left to drain.
            return;
        }
        let _ = done_rx.await;
    }

    /// Take ownership of the inbound sequence. `None` after the first call.
    pub fn take_responses(&mut self) -> Option<Responses<In>> {
        self.responses.take()
    }

    /// Current lifecycle state snapshot.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The recorded terminal failure cause, or a generic closed error.
    fn terminal_cause(&self) -> StreamError {
        self.terminal
            .lock()
            .ok()
            .and_then(|cause| cause.clone())
            .unwrap_or(StreamError::Closed)
    }
}

enum ConnectOutcome<T> {
    Opened(T),
    Failed(StreamError),
    Cancelled,
    CloseRequested,
}

enum BackoffOutcome {
    Retry,
    Cancelled,
    CloseRequested,
}

/// Background task owning the transport and the lifecycle state machine.
struct Driver<C: Connector, Cd: Codec> {
    connector: C,
    codec: Cd,
    url: String,
    bearer_token: Option<String>,
    cancel: CancellationToken,
    cmd_rx: mpsc::UnboundedReceiver<Command<Cd::Out>>,
    sink: Option<ResponseSink<Cd::In>>,
    queue: OutboundQueue<Cd::Out>,
    retry: RetryCoordinator,
    state: StateCell,
    terminal: Arc<Mutex<Option<StreamError>>>,
    completing: Option<oneshot::Sender<()>>,
    hook: Option<CompletionHook<Cd::Out>>,
    owner_gone: bool,
}

impl<C: Connector, Cd: Codec> Driver<C, Cd> {
    async fn run(mut self) {
        if self.cancel.is_cancelled() {
            // Cancelled before construction finished: no transport is ever
            // created.
            self.finish(Some(StreamError::Aborted));
            return;
        }

        let mut transport = loop {
            self.state.advance(ConnectionState::Connecting);
            debug!(url = %self.url, attempt = self.retry.attempts_made(), "connecting");

            let outcome = {
                let connect = self
                    .connector
                    .connect(&self.url, self.bearer_token.as_deref());
                tokio::pin!(connect);
                loop {
                    tokio::select! {
                        res = &mut connect => break match res {
                            Ok(transport) => ConnectOutcome::Opened(transport),
                            Err(e) => ConnectOutcome::Failed(e),
                        },
                        _ = self.cancel.cancelled() => break ConnectOutcome::Cancelled,
                        cmd = self.cmd_rx.recv(), if !self.owner_gone => {
                            match cmd {
                                Some(Command::Send { payload, done }) => {
                                    self.queue.push(QueuedMessage { payload, done });
                                }
                                Some(Command::Complete { done }) => {
                                    self.completing = Some(done);
                                }
                                None => self.owner_gone = true,
                            }
                            if (self.completing.is_some() || self.owner_gone)
                                && self.queue.is_empty()
                            {
                                break ConnectOutcome::CloseRequested;
                            }
                        }
                    }
                }
            };

            match outcome {
                ConnectOutcome::Opened(transport) => break transport,
                ConnectOutcome::Cancelled => {
                    self.finish(Some(StreamError::Aborted));
                    return;
                }
                ConnectOutcome::CloseRequested => {
                    // Closed before ever connecting: the transport close
                    // event will never fire, so go to CLOSED directly. The
                    // hook's final message has nowhere to go.
                    if let Some(hook) = self.hook.take() {
                        let _ = hook();
                    }
                    self.finish(None);
                    return;
                }
                ConnectOutcome::Failed(error) => {
                    warn!(url = %self.url, error = %error, "connection attempt failed");
                    if !self.retry.schedule() {
                        let error = StreamError::MaxRetriesExceeded(self.retry.max_attempts());
                        error!(url = %self.url, error = %error, "giving up");
                        self.finish(Some(error));
                        return;
                    }
                    match self.wait_for_retry().await {
                        BackoffOutcome::Retry => continue,
                        BackoffOutcome::Cancelled => {
                            self.finish(Some(StreamError::Aborted));
                            return;
                        }
                        BackoffOutcome::CloseRequested => {
                            if let Some(hook) = self.hook.take() {
                                let _ = hook();
                            }
                            self.finish(None);
                            return;
                        }
                    }
                }
            }
        };

        self.state.advance(ConnectionState::Connected);
        self.retry.reset();
        info!(url = %self.url, "connected");

        loop {
            // Drain strictly in enqueue order. Each write is awaited to
            // completion before the next pop, so at most one frame is in
            // flight; the transport's own flush is the backpressure gate.
            while let Some(entry) = self.queue.pop() {
                match self.codec.encode(&entry.payload) {
                    Ok(frame) => match transport.send(frame).await {
                        Ok(()) => entry.settle(Ok(())),
                        Err(error) => {
                            // One failed write does not block the rest.
                            warn!(error = %error, "write failed");
                            entry.settle(Err(error));
                        }
                    },
                    Err(error) => entry.settle(Err(error)),
                }
            }

            if self.completing.is_some() || self.owner_gone {
                self.finish_graceful(transport).await;
                return;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    transport.close().await;
                    self.finish(Some(StreamError::Aborted));
                    return;
                }
                cmd = self.cmd_rx.recv(), if !self.owner_gone => {
                    match cmd {
                        Some(Command::Send { payload, done }) => {
                            self.queue.push(QueuedMessage { payload, done });
                        }
                        Some(Command::Complete { done }) => {
                            self.completing = Some(done);
                        }
                        None => self.owner_gone = true,
                    }
                }
                event = transport.next_event() => match event {
                    TransportEvent::Message(frame) => match self.codec.decode(&frame) {
                        Ok(msg) => {
                            if let Some(sink) = &self.sink {
                                sink.deliver(msg);
                            }
                        }
                        Err(error) => {
                            // Malformed inbound payload is fatal: the frame
                            // boundary can no longer be trusted.
                            warn!(error = %error, "failed to parse inbound frame, tearing down");
                            transport.close().await;
                            self.finish(Some(error));
                            return;
                        }
                    },
                    TransportEvent::Closed => {
                        let cause =
                            StreamError::Connection("connection closed unexpectedly".into());
                        warn!(url = %self.url, "transport closed without complete()");
                        self.finish(Some(cause));
                        return;
                    }
                    TransportEvent::Failed(error) => {
                        error!(url = %self.url, error = %error, "transport failed");
                        transport.close().await;
                        self.finish(Some(error));
                        return;
                    }
                }
            }
        }
    }

    /// Sit out the backoff delay, still servicing commands and
    /// cancellation.
    async fn wait_for_retry(&mut self) -> BackoffOutcome {
        loop {
            tokio::select! {
                _ = self.retry.fired() => return BackoffOutcome::Retry,
                _ = self.cancel.cancelled() => return BackoffOutcome::Cancelled,
                cmd = self.cmd_rx.recv(), if !self.owner_gone => {
                    match cmd {
                        Some(Command::Send { payload, done }) => {
                            self.queue.push(QueuedMessage { payload, done });
                        }
                        Some(Command::Complete { done }) => {
                            self.completing = Some(done);
                        }
                        None => self.owner_gone = true,
                    }
                    if (self.completing.is_some() || self.owner_gone)
                        && self.queue.is_empty()
                    {
                        return BackoffOutcome::CloseRequested;
                    }
                }
            }
        }
    }

    /// Graceful shutdown after the queue drained: hook, CLOSING, transport
    /// close, then CLOSED on the transport's close event.
    async fn finish_graceful(&mut self, mut transport: C::Transport) {
        if let Some(hook) = self.hook.take() {
            if let Some(msg) = hook() {
                if let Ok(frame) = self.codec.encode(&msg) {
                    let _ = transport.send(frame).await;
                }
            }
        }

        self.state.advance(ConnectionState::Closing);
        transport.close().await;

        // Inbound frames racing the close handshake are still delivered.
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = transport.next_event() => match event {
                    TransportEvent::Message(frame) => {
                        if let Ok(msg) = self.codec.decode(&frame) {
                            if let Some(sink) = &self.sink {
                                sink.deliver(msg);
                            }
                        }
                    }
                    TransportEvent::Closed | TransportEvent::Failed(_) => break,
                }
            }
        }

        info!(url = %self.url, "stream completed");
        self.finish(None);
    }

    /// Terminal transition: cancel retries, advance to CLOSED, settle every
    /// outstanding send, end the inbound sequence, and acknowledge a
    /// pending `complete()`.
    fn finish(&mut self, cause: Option<StreamError>) {
        self.retry.cancel();
        self.state.advance(ConnectionState::Closed);

        if let Ok(mut terminal) = self.terminal.lock() {
            terminal.clone_from(&cause);
        }

        match &cause {
            Some(error) => self.queue.fail_all(error),
            None => self.queue.fail_all(&StreamError::Closed),
        }

        if let Some(sink) = self.sink.take() {
            match cause {
                Some(error) => sink.end_with(error),
                None => sink.end(),
            }
        }

        if let Some(done) = self.completing.take() {
            let _ = done.send(());
        }
    }
}

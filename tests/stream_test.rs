//! End-to-end driver behavior over a scripted in-memory transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use tether::{
    BidiStream, Codec, ConnectionState, Connector, MsgPackCodec, RetryConfig, StreamError,
    StreamOptions, Transport, TransportEvent,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    seq: u32,
    body: String,
}

fn note(seq: u32) -> Note {
    Note {
        seq,
        body: format!("note-{seq}"),
    }
}

fn codec() -> MsgPackCodec<Note, Note> {
    MsgPackCodec::new()
}

/// Per-connection outcome the mock connector replays in order. Once the
/// script runs out every further attempt opens.
#[derive(Clone)]
enum ConnectScript {
    Open,
    Refuse,
    Hold(Arc<Notify>),
}

#[derive(Clone)]
struct MockConnector {
    script: Arc<Mutex<VecDeque<ConnectScript>>>,
    attempts: Arc<AtomicUsize>,
    handles: Arc<Mutex<Vec<TransportHandle>>>,
    seen_bearer: Arc<Mutex<Option<String>>>,
}

impl MockConnector {
    fn new(script: Vec<ConnectScript>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            attempts: Arc::new(AtomicUsize::new(0)),
            handles: Arc::new(Mutex::new(Vec::new())),
            seen_bearer: Arc::new(Mutex::new(None)),
        }
    }

    fn always_open() -> Self {
        Self::new(Vec::new())
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn handle_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    fn handle(&self, index: usize) -> TransportHandle {
        self.handles.lock().unwrap()[index].clone()
    }

    fn open(&self) -> Result<MockTransport, StreamError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let write_ok = Arc::new(AtomicBool::new(true));
        let close_calls = Arc::new(AtomicUsize::new(0));
        self.handles.lock().unwrap().push(TransportHandle {
            writes: Arc::clone(&writes),
            events: events_tx.clone(),
            write_ok: Arc::clone(&write_ok),
            close_calls: Arc::clone(&close_calls),
        });
        Ok(MockTransport {
            writes,
            events_tx,
            events_rx,
            write_ok,
            close_calls,
            closed: false,
        })
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(
        &self,
        _url: &str,
        bearer_token: Option<&str>,
    ) -> Result<MockTransport, StreamError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self.seen_bearer.lock().unwrap() = bearer_token.map(str::to_owned);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConnectScript::Open);
        match step {
            ConnectScript::Open => self.open(),
            ConnectScript::Refuse => Err(StreamError::Connection("refused".into())),
            ConnectScript::Hold(gate) => {
                gate.notified().await;
                self.open()
            }
        }
    }
}

/// Test-side view of one opened mock transport.
#[derive(Clone)]
struct TransportHandle {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    write_ok: Arc<AtomicBool>,
    close_calls: Arc<AtomicUsize>,
}

impl TransportHandle {
    fn written(&self) -> Vec<Note> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|frame| codec().decode(frame).unwrap())
            .collect()
    }

    fn push_message(&self, msg: &Note) {
        let frame = codec().encode(msg).unwrap();
        let _ = self.events.send(TransportEvent::Message(frame));
    }

    fn push_raw(&self, frame: Vec<u8>) {
        let _ = self.events.send(TransportEvent::Message(frame));
    }

    fn drop_connection(&self) {
        let _ = self.events.send(TransportEvent::Closed);
    }

    fn refuse_writes(&self) {
        self.write_ok.store(false, Ordering::SeqCst);
    }

    fn allow_writes(&self) {
        self.write_ok.store(true, Ordering::SeqCst);
    }

    fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

struct MockTransport {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    write_ok: Arc<AtomicBool>,
    close_calls: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), StreamError> {
        if !self.write_ok.load(Ordering::SeqCst) {
            return Err(StreamError::Connection("write refused".into()));
        }
        self.writes.lock().unwrap().push(frame);
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        self.events_rx.recv().await.unwrap_or(TransportEvent::Closed)
    }

    async fn close(&mut self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed {
            self.closed = true;
            // A well-behaved peer answers the close handshake.
            let _ = self.events_tx.send(TransportEvent::Closed);
        }
    }
}

fn retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
        backoff_factor: 2.0,
        jitter: 0.0,
    }
}

fn open_stream(connector: MockConnector, options: StreamOptions) -> BidiStream<Note, Note> {
    BidiStream::connect(connector, codec(), options)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never reached");
}

#[tokio::test]
async fn sends_are_written_in_order_once_connected() {
    init_tracing();
    let connector = MockConnector::always_open();
    let stream = open_stream(connector.clone(), StreamOptions::new("ws://mock"));

    stream.send(note(1)).await.unwrap();
    stream.send(note(2)).await.unwrap();
    stream.send(note(3)).await.unwrap();

    assert!(stream.is_connected());
    assert_eq!(connector.attempts(), 1);
    assert_eq!(connector.handle(0).written(), vec![note(1), note(2), note(3)]);
}

#[tokio::test]
async fn sends_queue_while_connecting_and_flush_in_order() {
    let gate = Arc::new(Notify::new());
    let connector = MockConnector::new(vec![ConnectScript::Hold(Arc::clone(&gate))]);
    let stream = open_stream(connector.clone(), StreamOptions::new("ws://mock"));

    let (a, b, c, ()) = tokio::join!(
        stream.send(note(1)),
        stream.send(note(2)),
        stream.send(note(3)),
        async {
            // All three are queued before the connection is allowed to open.
            tokio::task::yield_now().await;
            gate.notify_one();
        }
    );

    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(connector.handle(0).written(), vec![note(1), note(2), note(3)]);
}

#[tokio::test(start_paused = true)]
async fn retries_with_backoff_until_an_attempt_succeeds() {
    let connector = MockConnector::new(vec![ConnectScript::Refuse, ConnectScript::Refuse]);
    let options = StreamOptions::new("ws://mock").with_retry(retry(5));
    let stream = open_stream(connector.clone(), options);

    let start = tokio::time::Instant::now();
    stream.send(note(7)).await.unwrap();

    // Failures at t=0 and t=100ms, success at t=300ms.
    assert_eq!(start.elapsed(), Duration::from_millis(300));
    assert_eq!(connector.attempts(), 3);
    assert_eq!(connector.handle(0).written(), vec![note(7)]);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_the_attempt_budget() {
    let connector = MockConnector::new(vec![ConnectScript::Refuse; 10]);
    let options = StreamOptions::new("ws://mock").with_retry(retry(3));
    let mut stream = open_stream(connector.clone(), options);
    let mut responses = stream.take_responses().unwrap();

    let err = stream.send(note(1)).await.unwrap_err();
    assert_eq!(err, StreamError::MaxRetriesExceeded(3));
    assert_eq!(
        err.to_string(),
        "Max reconnection attempts (3) reached"
    );

    // Initial attempt plus three retries.
    assert_eq!(connector.attempts(), 4);
    assert_eq!(stream.state(), ConnectionState::Closed);

    // The terminal cause replays to however many pulls come later.
    assert_eq!(
        responses.next().await,
        Some(Err(StreamError::MaxRetriesExceeded(3)))
    );
    assert_eq!(
        responses.next().await,
        Some(Err(StreamError::MaxRetriesExceeded(3)))
    );
}

#[tokio::test]
async fn complete_drains_the_queue_before_closing() {
    let gate = Arc::new(Notify::new());
    let connector = MockConnector::new(vec![ConnectScript::Hold(Arc::clone(&gate))]);
    let stream = open_stream(connector.clone(), StreamOptions::new("ws://mock"));

    // Two sends and the completion request all land while the connection is
    // still being held open, then the gate releases.
    let (a, b, (), ()) = tokio::join!(
        stream.send(note(1)),
        stream.send(note(2)),
        stream.complete(),
        async {
            tokio::task::yield_now().await;
            gate.notify_one();
        }
    );
    a.unwrap();
    b.unwrap();

    let handle = connector.handle(0);
    assert_eq!(handle.written(), vec![note(1), note(2)]);
    assert_eq!(handle.close_calls(), 1);
    assert_eq!(stream.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn complete_is_idempotent() {
    let connector = MockConnector::always_open();
    let stream = open_stream(connector.clone(), StreamOptions::new("ws://mock"));

    stream.send(note(1)).await.unwrap();
    stream.complete().await;
    stream.complete().await;
    stream.complete().await;

    assert_eq!(connector.handle(0).close_calls(), 1);
    assert_eq!(
        stream.send(note(2)).await.unwrap_err(),
        StreamError::Completed
    );
}

#[tokio::test]
async fn completion_hook_emits_one_final_message() {
    let connector = MockConnector::always_open();
    let stream = BidiStream::connect_with_hook(
        connector.clone(),
        codec(),
        StreamOptions::new("ws://mock"),
        Some(Box::new(|| Some(note(99)))),
    );

    stream.send(note(1)).await.unwrap();
    stream.complete().await;

    assert_eq!(connector.handle(0).written(), vec![note(1), note(99)]);
}

#[tokio::test]
async fn inbound_messages_buffer_until_pulled() {
    let connector = MockConnector::always_open();
    let mut stream = open_stream(connector.clone(), StreamOptions::new("ws://mock"));
    let mut responses = stream.take_responses().unwrap();
    assert!(stream.take_responses().is_none());

    wait_until(|| connector.handle_count() == 1).await;
    let handle = connector.handle(0);
    handle.push_message(&note(1));
    handle.push_message(&note(2));

    assert_eq!(responses.next().await, Some(Ok(note(1))));
    assert_eq!(responses.next().await, Some(Ok(note(2))));
}

#[tokio::test]
async fn a_waiting_consumer_wakes_on_arrival() {
    let connector = MockConnector::always_open();
    let mut stream = open_stream(connector.clone(), StreamOptions::new("ws://mock"));
    let mut responses = stream.take_responses().unwrap();

    wait_until(|| connector.handle_count() == 1).await;
    let handle = connector.handle(0);

    let (got, ()) = tokio::join!(responses.next(), async {
        tokio::task::yield_now().await;
        handle.push_message(&note(5));
    });
    assert_eq!(got, Some(Ok(note(5))));
}

#[tokio::test]
async fn unexpected_close_after_connected_is_terminal() {
    let connector = MockConnector::always_open();
    let mut stream = open_stream(connector.clone(), StreamOptions::new("ws://mock"));
    let mut responses = stream.take_responses().unwrap();

    stream.send(note(1)).await.unwrap();
    connector.handle(0).drop_connection();

    let expected = StreamError::Connection("connection closed unexpectedly".into());
    assert_eq!(responses.next().await, Some(Err(expected.clone())));
    assert_eq!(stream.state(), ConnectionState::Closed);

    // No reconnect is attempted once the stream had been connected.
    assert_eq!(connector.attempts(), 1);
    assert_eq!(stream.send(note(2)).await.unwrap_err(), expected);
}

#[tokio::test]
async fn malformed_inbound_frame_tears_the_stream_down() {
    let connector = MockConnector::always_open();
    let mut stream = open_stream(connector.clone(), StreamOptions::new("ws://mock"));
    let mut responses = stream.take_responses().unwrap();

    stream.send(note(1)).await.unwrap();
    connector.handle(0).push_raw(vec![0xc1]);

    match responses.next().await {
        Some(Err(StreamError::Parse(_))) => {}
        other => panic!("expected parse failure, got {other:?}"),
    }
    assert_eq!(stream.state(), ConnectionState::Closed);
    assert_eq!(connector.handle(0).close_calls(), 1);
}

#[tokio::test]
async fn a_failed_write_fails_only_that_message() {
    let connector = MockConnector::always_open();
    let stream = open_stream(connector.clone(), StreamOptions::new("ws://mock"));

    stream.send(note(1)).await.unwrap();
    let handle = connector.handle(0);

    handle.refuse_writes();
    assert!(matches!(
        stream.send(note(2)).await,
        Err(StreamError::Connection(_))
    ));

    handle.allow_writes();
    stream.send(note(3)).await.unwrap();

    assert!(stream.is_connected());
    assert_eq!(handle.written(), vec![note(1), note(3)]);
}

#[tokio::test]
async fn cancellation_aborts_pending_work() {
    let gate = Arc::new(Notify::new());
    let connector = MockConnector::new(vec![ConnectScript::Hold(Arc::clone(&gate))]);
    let token = CancellationToken::new();
    let options = StreamOptions::new("ws://mock").with_cancel(token.clone());
    let mut stream = open_stream(connector.clone(), options);
    let mut responses = stream.take_responses().unwrap();

    let (sent, ()) = tokio::join!(stream.send(note(1)), async {
        tokio::task::yield_now().await;
        token.cancel();
    });

    assert_eq!(sent.unwrap_err(), StreamError::Aborted);
    assert_eq!(responses.next().await, Some(Err(StreamError::Aborted)));
    assert_eq!(stream.state(), ConnectionState::Closed);
    assert_eq!(stream.send(note(2)).await.unwrap_err(), StreamError::Aborted);
}

#[tokio::test]
async fn a_cancelled_token_prevents_any_dialing() {
    let connector = MockConnector::always_open();
    let token = CancellationToken::new();
    token.cancel();
    let options = StreamOptions::new("ws://mock").with_cancel(token);
    let stream = open_stream(connector.clone(), options);

    wait_until(|| stream.state() == ConnectionState::Closed).await;
    assert_eq!(connector.attempts(), 0);
    assert_eq!(stream.send(note(1)).await.unwrap_err(), StreamError::Aborted);
}

#[tokio::test]
async fn inbound_racing_the_close_handshake_still_arrives() {
    let connector = MockConnector::always_open();
    let mut stream = open_stream(connector.clone(), StreamOptions::new("ws://mock"));
    let mut responses = stream.take_responses().unwrap();

    stream.send(note(1)).await.unwrap();
    connector.handle(0).push_message(&note(2));
    stream.complete().await;

    assert_eq!(responses.next().await, Some(Ok(note(2))));
    assert_eq!(responses.next().await, None);
}

#[tokio::test]
async fn state_progresses_through_the_lifecycle() {
    let connector = MockConnector::always_open();
    let stream = open_stream(connector.clone(), StreamOptions::new("ws://mock"));
    assert_eq!(stream.state(), ConnectionState::New);

    wait_until(|| stream.is_connected()).await;
    stream.complete().await;
    assert_eq!(stream.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn bearer_token_reaches_the_connector() {
    let connector = MockConnector::always_open();
    let options = StreamOptions::new("ws://mock").with_bearer_token("s3cret");
    let stream = open_stream(connector.clone(), options);

    wait_until(|| connector.handle_count() == 1).await;
    assert_eq!(
        connector.seen_bearer.lock().unwrap().as_deref(),
        Some("s3cret")
    );
    stream.complete().await;
}

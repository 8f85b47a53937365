use crate::{
    events::{CustomEvent, EventKind, Events, ExitedEvent},
    messages::{self, Message},
    requests::{Cancel, CancelArguments, Request},
    transport::{Channel, IoKind, TraceSink, Transport, TransportMessage},
};
use anyhow::{anyhow, Result};
use futures::{
    channel::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::{self, LocalBoxFuture, Shared},
    select_biased, Future, FutureExt as _, StreamExt as _,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use smol::Task;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::SeqCst},
        Arc, Weak,
    },
};
use util::{ForegroundExecutor, TryFutureExt as _};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

// Shared by every connection in the process, since a seq is also what a
// `cancel` request refers to.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

pub fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, SeqCst)
}

/// What the connection needs to know about the session that owns it.
pub trait ClientContext {
    fn supports_cancel_request(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("{command} request failed: {message}")]
    Failed {
        command: String,
        message: String,
        body: Option<Value>,
    },
    #[error("debug adapter connection was disposed")]
    Disposed,
    #[error("failed to write to debug adapter: {0}")]
    Transport(String),
    #[error("failed to serialize or deserialize message: {0}")]
    Serialization(String),
}

/// Fires at most once. A token whose source is dropped without cancelling
/// never fires.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Shared<oneshot::Receiver<()>>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.cancelled.peek(), Some(Ok(())))
    }

    pub async fn cancelled(&self) {
        if self.cancelled.clone().await.is_err() {
            future::pending::<()>().await;
        }
    }
}

pub struct CancellationSource {
    tx: Option<oneshot::Sender<()>>,
    token: CancellationToken,
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSource {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            token: CancellationToken {
                cancelled: rx.shared(),
            },
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.send(()).ok();
        }
    }
}

type ResponseHandlers = Arc<Mutex<HashMap<u64, oneshot::Sender<messages::Response>>>>;
type RequestHandler = Arc<dyn Fn(Option<Value>) -> LocalBoxFuture<'static, Result<Value>>>;

struct EventSubscriber {
    kinds: Vec<EventKind>,
    tx: UnboundedSender<Events>,
}

#[derive(Default)]
struct Handlers {
    events: Vec<EventSubscriber>,
    custom_events: Vec<UnboundedSender<CustomEvent>>,
    requests: HashMap<String, RequestHandler>,
}

/// A correlated request/response and event API over one adapter channel.
pub struct DebugAdapterClient {
    id: SessionId,
    channel: Arc<dyn Channel>,
    context: Arc<dyn ClientContext>,
    response_handlers: ResponseHandlers,
    handlers: Mutex<Handlers>,
    all_threads_continued: AtomicBool,
    disposed: AtomicBool,
    trace_sink: Option<Arc<dyn TraceSink>>,
    executor: ForegroundExecutor,
    input_task: Mutex<Option<Task<()>>>,
}

impl DebugAdapterClient {
    pub fn new(
        id: SessionId,
        transport: Transport,
        context: Arc<dyn ClientContext>,
        trace_sink: Option<Arc<dyn TraceSink>>,
        executor: ForegroundExecutor,
    ) -> Arc<Self> {
        let Transport { channel, inbound } = transport;
        let this = Arc::new(Self {
            id,
            channel,
            context,
            response_handlers: Default::default(),
            handlers: Default::default(),
            all_threads_continued: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            trace_sink,
            executor: executor.clone(),
            input_task: Mutex::new(None),
        });
        let input_task = executor.spawn(Self::handle_input(Arc::downgrade(&this), inbound));
        *this.input_task.lock() = Some(input_task);
        this
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(SeqCst)
    }

    /// Whether the last `continued` event or continue-family response
    /// reported that every thread resumed.
    pub fn all_threads_continued(&self) -> bool {
        self.all_threads_continued.load(SeqCst)
    }

    pub fn set_all_threads_continued(&self, all_threads_continued: bool) {
        self.all_threads_continued
            .store(all_threads_continued, SeqCst);
    }

    /// Sends a request and returns a future for its response body.
    ///
    /// The request is written before this returns, so requests reach the
    /// adapter in call order regardless of when the futures are polled.
    /// Firing `cancellation` sends a `cancel` request when the adapter
    /// supports it, but the returned future still waits for the real
    /// response.
    pub fn send_request(
        self: &Arc<Self>,
        command: &str,
        arguments: Option<Value>,
        cancellation: Option<CancellationToken>,
    ) -> impl Future<Output = Result<Option<Value>, RequestError>> + 'static {
        let seq = next_seq();
        let (tx, mut rx) = oneshot::channel();

        let send = if self.is_disposed() {
            Err(RequestError::Disposed)
        } else {
            self.response_handlers.lock().insert(seq, tx);
            let send = self.write(&Message::Request(messages::Request {
                seq,
                command: command.to_string(),
                arguments,
            }));
            if send.is_err() {
                self.response_handlers.lock().remove(&seq);
            }
            send
        };

        let this = Arc::downgrade(self);
        async move {
            send?;
            let response = match cancellation {
                None => rx.await,
                Some(token) => {
                    let cancelled = token.cancelled().fuse();
                    futures::pin_mut!(cancelled);
                    select_biased! {
                        response = rx => response,
                        _ = cancelled => {
                            Self::request_cancellation(&this, seq);
                            rx.await
                        }
                    }
                }
            };

            let response = response.map_err(|_| RequestError::Disposed)?;
            if response.success {
                Ok(response.body)
            } else {
                Err(RequestError::Failed {
                    message: response.error_message(),
                    command: response.command,
                    body: response.body,
                })
            }
        }
    }

    pub fn request<R: Request>(
        self: &Arc<Self>,
        arguments: R::Arguments,
    ) -> impl Future<Output = Result<R::Response, RequestError>> + 'static
    where
        R::Response: 'static,
    {
        self.request_with_cancellation::<R>(arguments, None)
    }

    pub fn request_with_cancellation<R: Request>(
        self: &Arc<Self>,
        arguments: R::Arguments,
        cancellation: Option<CancellationToken>,
    ) -> impl Future<Output = Result<R::Response, RequestError>> + 'static
    where
        R::Response: 'static,
    {
        let response = match serde_json::to_value(arguments) {
            Ok(Value::Null) => Ok(self.send_request(R::COMMAND, None, cancellation)),
            Ok(arguments) => Ok(self.send_request(R::COMMAND, Some(arguments), cancellation)),
            Err(error) => Err(RequestError::Serialization(error.to_string())),
        };

        async move {
            let body = response?.await?;
            parse_body::<R::Response>(R::COMMAND, body)
        }
    }

    /// Subscribes to the given standard events. Events arrive in the order
    /// the adapter sent them, interleaved across kinds.
    pub fn on_events(&self, kinds: &[EventKind]) -> UnboundedReceiver<Events> {
        let (tx, rx) = mpsc::unbounded();
        if !self.is_disposed() {
            self.handlers.lock().events.push(EventSubscriber {
                kinds: kinds.to_vec(),
                tx,
            });
        }
        rx
    }

    /// Subscribes to every event whose name is not a standard one.
    pub fn on_custom_events(&self) -> UnboundedReceiver<CustomEvent> {
        let (tx, rx) = mpsc::unbounded();
        if !self.is_disposed() {
            self.handlers.lock().custom_events.push(tx);
        }
        rx
    }

    /// Handles a reverse request sent by the adapter.
    pub fn on_request<R, F, Fut>(&self, handler: F)
    where
        R: 'static + Request,
        F: 'static + Fn(R::Arguments) -> Fut,
        Fut: 'static + Future<Output = Result<R::Response>>,
    {
        let handler = Arc::new(handler);
        self.on_custom_request(R::COMMAND, move |arguments| {
            let handler = handler.clone();
            async move {
                let arguments =
                    serde_json::from_value::<R::Arguments>(arguments.unwrap_or(Value::Null))?;
                let response = (*handler)(arguments).await?;
                Ok(serde_json::to_value(response)?)
            }
        });
    }

    pub fn on_custom_request<F, Fut>(&self, command: &str, handler: F)
    where
        F: 'static + Fn(Option<Value>) -> Fut,
        Fut: 'static + Future<Output = Result<Value>>,
    {
        self.handlers.lock().requests.insert(
            command.to_string(),
            Arc::new(move |arguments| handler(arguments).boxed_local()),
        );
    }

    /// Tears the connection down. In-flight requests fail with
    /// [`RequestError::Disposed`] and subscribers see their streams end.
    pub fn dispose(&self) {
        if self.disposed.swap(true, SeqCst) {
            return;
        }
        log::debug!("disposing debug adapter connection for {}", self.id);

        self.response_handlers.lock().clear();
        *self.handlers.lock() = Handlers::default();
        self.channel.close();
        self.input_task.lock().take();
    }

    async fn handle_input(this: Weak<Self>, mut inbound: UnboundedReceiver<TransportMessage>) {
        loop {
            let message = inbound.next().await;
            let Some(this) = this.upgrade() else {
                break;
            };
            match message {
                Some(TransportMessage::Message(text)) => this.handle_message(&text),
                Some(TransportMessage::Closed { code, reason }) => {
                    this.handle_close(code, reason);
                    break;
                }
                None => {
                    this.handle_close(-1, Some("debug adapter channel ended".into()));
                    break;
                }
            }
        }
    }

    fn handle_message(self: &Arc<Self>, text: &str) {
        self.trace(IoKind::Recv, text);

        let message = match serde_json::from_str::<Message>(text) {
            Ok(message) => message,
            Err(error) => {
                log::error!("{}: failed to deserialize message: {error}\n{text}", self.id);
                return;
            }
        };

        match message {
            Message::Response(response) => {
                if let Some(tx) = self.response_handlers.lock().remove(&response.request_seq) {
                    tx.send(response).ok();
                } else {
                    log::warn!(
                        "{}: dropping response to unknown request {} ({})",
                        self.id,
                        response.request_seq,
                        response.command
                    );
                }
            }
            Message::Event(event) => {
                let event = Events::parse(event);
                if let Events::Continued(continued) = &event {
                    if let Some(all_threads_continued) = continued.all_threads_continued {
                        self.set_all_threads_continued(all_threads_continued);
                    }
                }
                self.dispatch_event(event);
            }
            Message::Request(request) => self.handle_reverse_request(request),
        }
    }

    fn handle_close(&self, code: i64, reason: Option<String>) {
        log::info!(
            "{}: debug adapter channel closed with code {code}: {}",
            self.id,
            reason.as_deref().unwrap_or("no reason given")
        );
        self.response_handlers.lock().clear();
        self.dispatch_event(Events::Exited(ExitedEvent {
            exit_code: code,
            reason,
        }));
    }

    fn dispatch_event(&self, event: Events) {
        let mut handlers = self.handlers.lock();
        match (&event, event.kind()) {
            (Events::Custom(custom), _) => {
                if handlers.custom_events.is_empty() {
                    log::debug!("{}: unhandled custom event {}", self.id, custom.event);
                }
                handlers
                    .custom_events
                    .retain(|tx| tx.unbounded_send(custom.clone()).is_ok());
            }
            (_, Some(kind)) => {
                handlers.events.retain(|subscriber| {
                    !subscriber.kinds.contains(&kind)
                        || subscriber.tx.unbounded_send(event.clone()).is_ok()
                });
            }
            (_, None) => {}
        }
    }

    fn handle_reverse_request(self: &Arc<Self>, request: messages::Request) {
        let handler = self.handlers.lock().requests.get(&request.command).cloned();
        let Some(handler) = handler else {
            log::warn!("{}: unhandled reverse request {}", self.id, request.command);
            let error = anyhow!("unsupported request: {}", request.command);
            self.respond(request.seq, request.command, Err(error));
            return;
        };

        let this = self.clone();
        self.executor
            .spawn(async move {
                let result = (*handler)(request.arguments).await;
                this.respond(request.seq, request.command, result);
            })
            .detach();
    }

    fn respond(&self, request_seq: u64, command: String, result: Result<Value>) {
        let (success, message, body) = match result {
            Ok(body) => (true, None, Some(body).filter(|body| !body.is_null())),
            Err(error) => (false, Some(error.to_string()), None),
        };
        let response = Message::Response(messages::Response {
            seq: next_seq(),
            request_seq,
            success,
            command,
            message,
            body,
        });
        if let Err(error) = self.write(&response) {
            log::error!("{}: failed to answer reverse request: {error}", self.id);
        }
    }

    fn request_cancellation(this: &Weak<Self>, seq: u64) {
        let Some(this) = this.upgrade() else {
            return;
        };
        if !this.context.supports_cancel_request() {
            log::debug!("{}: adapter does not support cancelling request {seq}", this.id);
            return;
        }

        let cancel = this.request::<Cancel>(CancelArguments {
            request_id: Some(seq),
            progress_id: None,
        });
        this.executor.spawn(cancel.warn_on_err()).detach();
    }

    fn write(&self, message: &Message) -> Result<(), RequestError> {
        if self.is_disposed() {
            return Err(RequestError::Disposed);
        }
        let text = serde_json::to_string(message)
            .map_err(|error| RequestError::Serialization(error.to_string()))?;
        self.trace(IoKind::Send, &text);
        self.channel
            .send(text)
            .map_err(|error| RequestError::Transport(error.to_string()))
    }

    fn trace(&self, kind: IoKind, message: &str) {
        if let Some(trace_sink) = self.trace_sink.as_ref() {
            trace_sink.trace(self.id, kind, message);
        }
    }
}

impl fmt::Debug for DebugAdapterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugAdapterClient")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

// Adapters answer body-less requests with no body, `null` or `{}`.
fn parse_body<T: DeserializeOwned>(command: &str, body: Option<Value>) -> Result<T, RequestError> {
    let body = body.unwrap_or(Value::Null);
    serde_json::from_value::<T>(body.clone())
        .or_else(|error| match &body {
            Value::Object(map) if map.is_empty() => serde_json::from_value(Value::Null),
            _ => Err(error),
        })
        .map_err(|error| RequestError::Serialization(format!("{command} response: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::StoppedEvent,
        fake_adapter::{FakeAdapter, FakeReply},
        requests::{
            Continue, ContinueArguments, ContinueResponse, Evaluate, EvaluateArguments,
            EvaluateResponse, RunInTerminal, RunInTerminalResponse, Threads, ThreadsResponse,
        },
        types::{Thread, ThreadId},
    };
    use futures::{FutureExt, StreamExt as _};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashSet;

    #[ctor::ctor]
    fn init_logger() {
        if std::env::var("RUST_LOG").is_ok() {
            env_logger::init();
        }
    }

    #[derive(Default)]
    struct TestContext {
        supports_cancel_request: bool,
    }

    impl ClientContext for TestContext {
        fn supports_cancel_request(&self) -> bool {
            self.supports_cancel_request
        }
    }

    fn client(
        executor: &ForegroundExecutor,
        supports_cancel_request: bool,
    ) -> (FakeAdapter, Arc<DebugAdapterClient>) {
        let (fake, transport) = FakeAdapter::new();
        let client = DebugAdapterClient::new(
            SessionId(1),
            transport,
            Arc::new(TestContext {
                supports_cancel_request,
            }),
            None,
            executor.clone(),
        );
        (fake, client)
    }

    #[test]
    fn test_seq_numbers_are_unique_across_connections() {
        let executor = ForegroundExecutor::new();
        let (first, first_client) = client(&executor, false);
        let (second, second_client) = client(&executor, false);

        for _ in 0..3 {
            drop(first_client.send_request("threads", None, None));
            drop(second_client.send_request("threads", None, None));
        }

        let seqs = first
            .received_requests()
            .into_iter()
            .chain(second.received_requests())
            .map(|request| request.seq)
            .collect::<Vec<_>>();
        assert_eq!(seqs.len(), 6);
        assert_eq!(seqs.iter().collect::<HashSet<_>>().len(), 6);
    }

    #[test]
    fn test_responses_are_correlated_by_request_seq() {
        let executor = ForegroundExecutor::new();
        let (fake, client) = client(&executor, false);
        fake.hold_requests("evaluate");

        let first = executor.spawn(client.request::<Evaluate>(EvaluateArguments {
            expression: "a".into(),
            ..Default::default()
        }));
        let second = executor.spawn(client.request::<Evaluate>(EvaluateArguments {
            expression: "b".into(),
            ..Default::default()
        }));
        executor.run_until_parked();

        let pending = fake.pending_requests("evaluate");
        assert_eq!(pending.len(), 2);
        fake.respond(pending[1], FakeReply::Success(Some(json!({ "result": "2" }))))
            .unwrap();
        fake.respond(pending[0], FakeReply::Success(Some(json!({ "result": "1" }))))
            .unwrap();
        executor.run_until_parked();

        let first = executor.block_on(first).unwrap();
        let second = executor.block_on(second).unwrap();
        assert_eq!(first.result, "1");
        assert_eq!(second.result, "2");
    }

    #[derive(Default)]
    struct WireChannel {
        sent: Mutex<Vec<String>>,
    }

    impl Channel for WireChannel {
        fn send(&self, message: String) -> Result<()> {
            self.sent.lock().push(message);
            Ok(())
        }

        fn close(&self) {}
    }

    #[test]
    fn test_wire_format_of_responses() {
        let executor = ForegroundExecutor::new();
        let channel = Arc::new(WireChannel::default());
        let (inbound_tx, inbound_rx) = mpsc::unbounded();
        let client = DebugAdapterClient::new(
            SessionId(9),
            Transport::new(channel.clone(), inbound_rx),
            Arc::new(TestContext::default()),
            None,
            executor.clone(),
        );

        let threads = executor.spawn(client.send_request("threads", None, None));
        let sent: Value = serde_json::from_str(&channel.sent.lock()[0]).unwrap();
        assert_eq!(sent["type"], "request");
        assert_eq!(sent["command"], "threads");
        let seq = sent["seq"].as_u64().unwrap();

        inbound_tx
            .unbounded_send(TransportMessage::Message(format!(
                r#"{{"seq":1,"type":"response","request_seq":{seq},"command":"threads","success":true,"body":{{"threads":[]}}}}"#
            )))
            .unwrap();
        inbound_tx
            .unbounded_send(TransportMessage::Message(
                r#"{"seq":2,"type":"request","command":"startDebugging","arguments":{}}"#.into(),
            ))
            .unwrap();
        executor.run_until_parked();

        assert_eq!(
            executor.block_on(threads).unwrap(),
            Some(json!({ "threads": [] }))
        );

        let reply: Value = serde_json::from_str(channel.sent.lock().last().unwrap()).unwrap();
        assert_eq!(reply["type"], "response");
        assert_eq!(reply["request_seq"], 2);
        assert_eq!(reply["success"], false);
        assert!(reply.get("requestSeq").is_none());
    }

    #[test]
    fn test_failed_response() {
        let executor = ForegroundExecutor::new();
        let (fake, client) = client(&executor, false);
        fake.on_request::<Evaluate, _>(|_| Err(anyhow!("name is not defined")));

        let result = executor.block_on(client.request::<Evaluate>(EvaluateArguments {
            expression: "missing".into(),
            ..Default::default()
        }));
        match result {
            Err(RequestError::Failed {
                command, message, ..
            }) => {
                assert_eq!(command, "evaluate");
                assert_eq!(message, "name is not defined");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_body_less_responses() {
        let executor = ForegroundExecutor::new();
        let (fake, client) = client(&executor, false);
        fake.on_custom_request("continue", |_| FakeReply::Success(Some(json!({}))));

        let response = executor
            .block_on(client.request::<Continue>(ContinueArguments {
                thread_id: ThreadId(1),
                single_thread: None,
            }))
            .unwrap();
        assert_eq!(response, Some(ContinueResponse::default()));

        fake.on_custom_request("continue", |_| FakeReply::Success(None));
        let response = executor
            .block_on(client.request::<Continue>(ContinueArguments {
                thread_id: ThreadId(1),
                single_thread: None,
            }))
            .unwrap();
        assert_eq!(response, None);
    }

    #[test]
    fn test_cancellation_sends_cancel_and_keeps_waiting() {
        let executor = ForegroundExecutor::new();
        let (fake, client) = client(&executor, true);
        fake.hold_requests("threads");
        fake.on_custom_request("cancel", |_| FakeReply::Success(None));

        let mut source = CancellationSource::new();
        let task = executor.spawn(
            client.request_with_cancellation::<Threads>((), Some(source.token())),
        );
        executor.run_until_parked();

        source.cancel();
        executor.run_until_parked();

        let seq = fake.pending_requests("threads")[0];
        let cancels = fake.requests_for("cancel");
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].arguments, Some(json!({ "requestId": seq })));

        fake.respond(
            seq,
            FakeReply::Success(Some(json!({ "threads": [{ "id": 1, "name": "main" }] }))),
        )
        .unwrap();
        let response = executor.block_on(task).unwrap();
        assert_eq!(
            response,
            ThreadsResponse {
                threads: vec![Thread {
                    id: ThreadId(1),
                    name: "main".into()
                }]
            }
        );
    }

    #[test]
    fn test_cancellation_without_adapter_support() {
        let executor = ForegroundExecutor::new();
        let (fake, client) = client(&executor, false);
        fake.hold_requests("threads");

        let mut source = CancellationSource::new();
        let task = executor.spawn(
            client.request_with_cancellation::<Threads>((), Some(source.token())),
        );
        source.cancel();
        executor.run_until_parked();
        assert!(fake.requests_for("cancel").is_empty());

        let seq = fake.pending_requests("threads")[0];
        fake.respond(seq, FakeReply::Failure("cancelled".into()))
            .unwrap();
        assert!(matches!(
            executor.block_on(task),
            Err(RequestError::Failed { .. })
        ));
    }

    #[test]
    fn test_dropped_cancellation_source_never_fires() {
        let source = CancellationSource::new();
        let token = source.token();
        drop(source);
        assert!(!token.is_cancelled());
        let fired = smol::block_on(async {
            futures::select_biased! {
                _ = token.cancelled().fuse() => true,
                _ = FutureExt::fuse(smol::Timer::after(std::time::Duration::from_millis(10))) => false,
            }
        });
        assert!(!fired);
    }

    #[test]
    fn test_events_are_routed_by_kind_in_arrival_order() {
        let executor = ForegroundExecutor::new();
        let (fake, client) = client(&executor, false);
        let mut lifecycle = client.on_events(&[EventKind::Stopped, EventKind::Continued]);
        let mut output = client.on_events(&[EventKind::Output]);
        let mut custom = client.on_custom_events();

        fake.fake_event("stopped", json!({ "reason": "pause", "threadId": 1 }));
        fake.fake_event("output", json!({ "output": "hello" }));
        fake.fake_event("continued", json!({ "threadId": 1, "allThreadsContinued": false }));
        fake.fake_event("rust/heartbeat", json!({ "n": 1 }));
        executor.run_until_parked();

        let stopped = executor.block_on(lifecycle.next()).unwrap();
        assert_eq!(
            stopped,
            Events::Stopped(StoppedEvent {
                reason: "pause".into(),
                description: None,
                thread_id: Some(ThreadId(1)),
                preserve_focus_hint: None,
                text: None,
                all_threads_stopped: None,
                hit_breakpoint_ids: None,
            })
        );
        let continued = executor.block_on(lifecycle.next()).unwrap();
        assert_eq!(continued.kind(), Some(EventKind::Continued));
        assert!(!client.all_threads_continued());

        let output = executor.block_on(output.next()).unwrap();
        assert_eq!(output.kind(), Some(EventKind::Output));

        let custom = executor.block_on(custom.next()).unwrap();
        assert_eq!(custom.event, "rust/heartbeat");
    }

    #[test]
    fn test_reverse_requests() {
        let executor = ForegroundExecutor::new();
        let (fake, client) = client(&executor, false);
        client.on_request::<RunInTerminal, _, _>(|arguments| async move {
            assert_eq!(arguments.args, vec!["cargo".to_string(), "run".to_string()]);
            Ok(RunInTerminalResponse {
                process_id: Some(42),
                shell_process_id: None,
            })
        });

        let handled = fake.fake_reverse_request(
            "runInTerminal",
            Some(json!({ "cwd": "/tmp", "args": ["cargo", "run"] })),
        );
        let unhandled = fake.fake_reverse_request("startDebugging", Some(json!({})));
        executor.run_until_parked();

        let responses = fake.received_responses();
        let handled = responses
            .iter()
            .find(|response| response.request_seq == handled)
            .unwrap();
        assert!(handled.success);
        assert_eq!(handled.body, Some(json!({ "processId": 42 })));

        let unhandled = responses
            .iter()
            .find(|response| response.request_seq == unhandled)
            .unwrap();
        assert!(!unhandled.success);
        assert_eq!(unhandled.command, "startDebugging");
        assert!(unhandled.message.is_some());
    }

    #[test]
    fn test_channel_close_fails_pending_requests_and_synthesizes_exited() {
        let executor = ForegroundExecutor::new();
        let (fake, client) = client(&executor, false);
        fake.hold_requests("stackTrace");
        let mut events = client.on_events(&[EventKind::Exited]);

        let pending = executor.spawn(client.send_request(
            "stackTrace",
            Some(json!({ "threadId": 1 })),
            None,
        ));
        executor.run_until_parked();
        fake.close(3, Some("adapter crashed"));
        executor.run_until_parked();

        assert!(matches!(
            executor.block_on(pending),
            Err(RequestError::Disposed)
        ));
        assert_eq!(
            executor.block_on(events.next()),
            Some(Events::Exited(ExitedEvent {
                exit_code: 3,
                reason: Some("adapter crashed".into()),
            }))
        );
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let executor = ForegroundExecutor::new();
        let (fake, client) = client(&executor, false);
        fake.hold_requests("threads");
        let mut events = client.on_events(EventKind::ALL);

        let pending = executor.spawn(client.request::<Threads>(()));
        executor.run_until_parked();

        client.dispose();
        client.dispose();
        assert!(fake.is_closed());
        assert!(matches!(
            executor.block_on(pending),
            Err(RequestError::Disposed)
        ));
        assert_eq!(executor.block_on(events.next()), None);
        assert!(matches!(
            executor.block_on(client.request::<Threads>(())),
            Err(RequestError::Disposed)
        ));
    }

    #[test]
    fn test_parse_body_accepts_empty_objects() {
        parse_body::<()>("configurationDone", Some(json!({}))).unwrap();
        parse_body::<()>("configurationDone", None).unwrap();
        let response =
            parse_body::<EvaluateResponse>("evaluate", Some(json!({ "result": "1" }))).unwrap();
        assert_eq!(response.result, "1");
        assert!(parse_body::<EvaluateResponse>("evaluate", None).is_err());
    }
}

use crate::{
    events::EventKind,
    messages::{self, Message},
    requests::{
        Attach, ConfigurationDone, Disconnect, Initialize, Launch, Request, SetBreakpoints,
        SetBreakpointsResponse, SetExceptionBreakpoints, SetFunctionBreakpoints, Terminate,
        Threads, ThreadsResponse,
    },
    transport::{Channel, Transport, TransportMessage},
    types::{Breakpoint, Capabilities, Thread, ThreadId},
};
use anyhow::{anyhow, Result};
use futures::channel::mpsc::{self, UnboundedSender};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

/// What a fake adapter does with an incoming request.
#[derive(Debug, Clone, PartialEq)]
pub enum FakeReply {
    Success(Option<Value>),
    Failure(String),
    /// Leave the request unanswered until [`FakeAdapter::respond`] is called.
    Pending,
}

type FakeRequestHandler = Box<dyn Send + FnMut(Option<Value>) -> FakeReply>;

#[derive(Default)]
struct FakeAdapterState {
    received_requests: Vec<messages::Request>,
    received_responses: Vec<messages::Response>,
    pending_requests: Vec<messages::Request>,
    events_after_response: HashMap<String, Vec<messages::Event>>,
    closed: bool,
}

/// An in-process stand-in for a debug adapter. Requests are answered by
/// handlers registered per command; requests without a handler stay pending.
#[derive(Clone)]
pub struct FakeAdapter {
    handlers: Arc<Mutex<HashMap<String, FakeRequestHandler>>>,
    state: Arc<Mutex<FakeAdapterState>>,
    outgoing_tx: UnboundedSender<TransportMessage>,
}

impl FakeAdapter {
    pub fn new() -> (Self, Transport) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded();
        let adapter = Self {
            handlers: Default::default(),
            state: Default::default(),
            outgoing_tx,
        };
        let transport = Transport::new(Arc::new(adapter.clone()), outgoing_rx);
        (adapter, transport)
    }

    /// Registers the handlers a well-behaved adapter needs to get a session
    /// running: `initialize` answers with `capabilities` and is followed by
    /// the `initialized` event, breakpoint requests report every breakpoint as
    /// verified and `threads` reports a single thread.
    pub fn handshake(&self, capabilities: Capabilities) {
        self.on_request::<Initialize, _>(move |_| Ok(capabilities.clone()));
        self.send_event_after_response(Initialize::COMMAND, EventKind::Initialized.name(), None);
        self.on_request::<Launch, _>(|_| Ok(()));
        self.on_request::<Attach, _>(|_| Ok(()));
        self.on_request::<ConfigurationDone, _>(|_| Ok(()));
        self.on_request::<SetBreakpoints, _>(|arguments| {
            let breakpoints = arguments
                .breakpoints
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(ix, breakpoint)| Breakpoint {
                    id: Some(ix as u64 + 1),
                    verified: true,
                    line: Some(breakpoint.line),
                    column: breakpoint.column,
                    ..Default::default()
                })
                .collect();
            Ok(SetBreakpointsResponse { breakpoints })
        });
        self.on_request::<SetFunctionBreakpoints, _>(|arguments| {
            Ok(SetBreakpointsResponse {
                breakpoints: arguments
                    .breakpoints
                    .iter()
                    .map(|_| Breakpoint {
                        verified: true,
                        ..Default::default()
                    })
                    .collect(),
            })
        });
        self.on_request::<SetExceptionBreakpoints, _>(|_| Ok(None));
        self.on_request::<Threads, _>(|_| {
            Ok(ThreadsResponse {
                threads: vec![Thread {
                    id: ThreadId(1),
                    name: "main".into(),
                }],
            })
        });
        self.on_request::<Disconnect, _>(|_| Ok(()));
        self.on_request::<Terminate, _>(|_| Ok(()));
    }

    pub fn on_request<R, F>(&self, mut handler: F)
    where
        R: 'static + Request,
        F: 'static + Send + FnMut(R::Arguments) -> Result<R::Response>,
    {
        self.on_custom_request(R::COMMAND, move |arguments| {
            let arguments = serde_json::from_value::<R::Arguments>(arguments.unwrap_or(Value::Null))
                .map_err(|error| anyhow!("invalid {} arguments: {error}", R::COMMAND));
            match arguments.and_then(&mut handler) {
                Ok(response) => FakeReply::Success(
                    serde_json::to_value(response)
                        .ok()
                        .filter(|body| !body.is_null()),
                ),
                Err(error) => FakeReply::Failure(error.to_string()),
            }
        });
    }

    pub fn on_custom_request<F>(&self, command: &str, handler: F)
    where
        F: 'static + Send + FnMut(Option<Value>) -> FakeReply,
    {
        self.handlers
            .lock()
            .insert(command.to_string(), Box::new(handler));
    }

    /// Holds every future request for `command` until it is answered with
    /// [`FakeAdapter::respond`].
    pub fn hold_requests(&self, command: &str) {
        self.on_custom_request(command, |_| FakeReply::Pending);
    }

    /// Queues `event` to be sent right after every successful response to
    /// `command`.
    pub fn send_event_after_response(&self, command: &str, event: &str, body: Option<Value>) {
        self.state
            .lock()
            .events_after_response
            .entry(command.to_string())
            .or_default()
            .push(messages::Event {
                seq: 0,
                event: event.to_string(),
                body,
            });
    }

    pub fn fake_event(&self, event: &str, body: impl Serialize) {
        let body = serde_json::to_value(body).ok().filter(|body| !body.is_null());
        self.send_message(Message::Event(messages::Event {
            seq: 0,
            event: event.to_string(),
            body,
        }));
    }

    /// Sends a request from the adapter to the client and returns its seq.
    pub fn fake_reverse_request(&self, command: &str, arguments: Option<Value>) -> u64 {
        let seq = crate::client::next_seq();
        self.send_message(Message::Request(messages::Request {
            seq,
            command: command.to_string(),
            arguments,
        }));
        seq
    }

    /// Answers a request that was held back by a [`FakeReply::Pending`] handler.
    pub fn respond(&self, request_seq: u64, reply: FakeReply) -> Result<()> {
        let request = {
            let mut state = self.state.lock();
            let ix = state
                .pending_requests
                .iter()
                .position(|request| request.seq == request_seq)
                .ok_or_else(|| anyhow!("no pending request with seq {request_seq}"))?;
            state.pending_requests.remove(ix)
        };
        self.reply(&request, reply);
        Ok(())
    }

    /// Closes the connection from the adapter side.
    pub fn close(&self, code: i64, reason: Option<&str>) {
        self.state.lock().closed = true;
        self.outgoing_tx
            .unbounded_send(TransportMessage::Closed {
                code,
                reason: reason.map(ToString::to_string),
            })
            .ok();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn received_requests(&self) -> Vec<messages::Request> {
        self.state.lock().received_requests.clone()
    }

    pub fn requests_for(&self, command: &str) -> Vec<messages::Request> {
        self.state
            .lock()
            .received_requests
            .iter()
            .filter(|request| request.command == command)
            .cloned()
            .collect()
    }

    pub fn received_commands(&self) -> Vec<String> {
        self.state
            .lock()
            .received_requests
            .iter()
            .map(|request| request.command.clone())
            .collect()
    }

    pub fn pending_requests(&self, command: &str) -> Vec<u64> {
        self.state
            .lock()
            .pending_requests
            .iter()
            .filter(|request| request.command == command)
            .map(|request| request.seq)
            .collect()
    }

    /// Responses the client sent to reverse requests.
    pub fn received_responses(&self) -> Vec<messages::Response> {
        self.state.lock().received_responses.clone()
    }

    fn handle_request(&self, request: messages::Request) {
        self.state.lock().received_requests.push(request.clone());

        let reply = match self.handlers.lock().get_mut(&request.command) {
            Some(handler) => {
                log::debug!("handled dap request. command:{}", request.command);
                handler(request.arguments.clone())
            }
            None => {
                log::debug!("unhandled dap request. command:{}", request.command);
                FakeReply::Pending
            }
        };

        if reply == FakeReply::Pending {
            self.state.lock().pending_requests.push(request);
        } else {
            self.reply(&request, reply);
        }
    }

    fn reply(&self, request: &messages::Request, reply: FakeReply) {
        let (success, message, body) = match reply {
            FakeReply::Success(body) => (true, None, body),
            FakeReply::Failure(message) => (false, Some(message), None),
            FakeReply::Pending => return,
        };
        self.send_message(Message::Response(messages::Response {
            seq: crate::client::next_seq(),
            request_seq: request.seq,
            success,
            command: request.command.clone(),
            message,
            body,
        }));

        if success {
            let events = self
                .state
                .lock()
                .events_after_response
                .get(&request.command)
                .cloned()
                .unwrap_or_default();
            for event in events {
                self.send_message(Message::Event(event));
            }
        }
    }

    fn send_message(&self, message: Message) {
        match serde_json::to_string(&message) {
            Ok(text) => {
                self.outgoing_tx
                    .unbounded_send(TransportMessage::Message(text))
                    .ok();
            }
            Err(error) => log::error!("failed to serialize fake adapter message: {error}"),
        }
    }
}

impl Channel for FakeAdapter {
    fn send(&self, message: String) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("fake adapter is closed"));
        }
        match serde_json::from_str::<Message>(&message)? {
            Message::Request(request) => self.handle_request(request),
            Message::Response(response) => self.state.lock().received_responses.push(response),
            Message::Event(event) => log::warn!("client sent an event: {}", event.event),
        }
        Ok(())
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }
}

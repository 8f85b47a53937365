use crate::{
    breakpoint_store::{BreakpointId, BreakpointStore, SourceBreakpoint, Uri},
    configuration::{DebugConfiguration, DebugRequestKind, DebugSessionOptions},
};
use anyhow::{anyhow, bail, Context as _, Result};
use dap::{
    debugger_settings::{DebuggerSettings, ThreadFallback},
    events::{
        BreakpointEvent, CapabilitiesEvent, ContinuedEvent, CustomEvent, ExitedEvent,
        OutputEvent, StoppedEvent, ThreadEvent,
    },
    requests::{
        Attach, ConfigurationDone, Continue, ContinueArguments, Disconnect, DisconnectArguments,
        Evaluate, EvaluateArguments, EvaluateResponse, Initialize, InitializeArguments, Launch,
        Next, Pause, PauseArguments, Request, Restart, RestartArguments, Scopes, ScopesArguments,
        SetBreakpoints, SetBreakpointsArguments, SetExceptionBreakpoints,
        SetExceptionBreakpointsArguments, SetFunctionBreakpoints, SetFunctionBreakpointsArguments,
        StackTrace, StackTraceArguments, StepArguments, StepBack, StepIn, StepOut, Terminate,
        TerminateArguments, Threads, Variables, VariablesArguments,
    },
    Capabilities, ClientContext, DebugAdapterClient, EventKind, Events, Scope, SessionId,
    LogTraceSink, Source, StackFrame, Thread, ThreadId, TraceSink, Transport, Variable,
};
use futures::{channel::mpsc::UnboundedReceiver, stream, FutureExt as _, StreamExt as _};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use smol::Task;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt, mem,
    sync::{Arc, Weak},
    time::Duration,
};
use util::{EventEmitter, ForegroundExecutor, PostInc, ResultExt as _};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Inactive,
    Initializing,
    Running,
    Stopped,
    Terminated,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Inactive, Initializing)
                | (Inactive, Terminated)
                | (Initializing, Running)
                | (Initializing, Stopped)
                | (Initializing, Terminated)
                | (Running, Stopped)
                | (Running, Terminated)
                | (Stopped, Running)
                | (Stopped, Terminated)
        )
    }

    /// Whether the adapter has been configured and accepts breakpoint updates.
    pub fn is_configured(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        old: SessionState,
        new: SessionState,
    },
    Stopped(StoppedEvent),
    Continued {
        thread_id: Option<ThreadId>,
        all_threads_continued: bool,
    },
    /// The adapter reported `terminated`. A `restart` payload asks for the
    /// session to be relaunched rather than torn down.
    Terminated {
        restart: Option<Value>,
    },
    Exited {
        exit_code: i64,
        reason: Option<String>,
    },
    BreakpointsChanged {
        uri: Uri,
    },
    ThreadsChanged,
    CurrentFrameChanged,
    CapabilitiesChanged,
    Output(OutputEvent),
    Custom(CustomEvent),
}

/// What one adapter made of one user breakpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeBreakpointStatus {
    pub breakpoint_id: BreakpointId,
    pub verified: bool,
    pub message: Option<String>,
    pub line: u32,
    pub column: Option<u32>,
    pub adapter_id: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugBreakpoint {
    pub breakpoint: SourceBreakpoint,
    pub status: Option<RuntimeBreakpointStatus>,
}

impl DebugBreakpoint {
    pub fn is_verified(&self) -> bool {
        self.status.as_ref().is_some_and(|status| status.verified)
    }
}

/// Adapter capabilities, shared with the connection so that it can decide
/// whether cancellation is supported.
#[derive(Clone, Default)]
pub struct SessionCapabilities(Arc<RwLock<Capabilities>>);

impl SessionCapabilities {
    pub fn get(&self) -> Capabilities {
        self.0.read().clone()
    }

    fn read<R>(&self, f: impl FnOnce(&Capabilities) -> R) -> R {
        f(&self.0.read())
    }

    fn set(&self, capabilities: Capabilities) {
        *self.0.write() = capabilities;
    }

    fn merge(&self, capabilities: Capabilities) {
        self.0.write().merge(capabilities);
    }
}

impl ClientContext for SessionCapabilities {
    fn supports_cancel_request(&self) -> bool {
        self.read(|capabilities| capabilities.supports_cancel_request.unwrap_or(false))
    }
}

/// The collaborators every session of a manager shares.
#[derive(Clone)]
pub struct SessionContext {
    pub breakpoint_store: Arc<BreakpointStore>,
    pub settings: DebuggerSettings,
    pub executor: ForegroundExecutor,
    pub trace_sink: Option<Arc<dyn TraceSink>>,
}

/// The sink adapter traffic is mirrored to. Without one from the caller,
/// traffic goes to the log.
fn trace_sink(cx: &SessionContext) -> Option<Arc<dyn TraceSink>> {
    if !cx.settings.log_dap_communications {
        return None;
    }
    Some(cx.trace_sink.clone().unwrap_or_else(|| {
        Arc::new(LogTraceSink::new(cx.settings.format_dap_log_messages))
    }))
}

struct State {
    state: SessionState,
    // Set once configuration starts. From then on store changes must be
    // relayed, since the configuration pass only reads the store once.
    configuring: bool,
    launched: bool,
    threads: Option<Vec<Thread>>,
    stack_frames: HashMap<ThreadId, Vec<StackFrame>>,
    // Bumped whenever the caches are invalidated, so that a fetch which
    // started before the invalidation does not repopulate them.
    generation: u64,
    stop_count: u64,
    current_thread: Option<ThreadId>,
    current_frame: Option<StackFrame>,
    breakpoint_statuses: BTreeMap<Uri, HashMap<BreakpointId, RuntimeBreakpointStatus>>,
}

impl State {
    fn invalidate(&mut self) {
        self.threads = None;
        self.stack_frames.clear();
        self.generation.post_inc();
    }
}

pub struct Session {
    id: SessionId,
    options: Arc<DebugSessionOptions>,
    configuration: DebugConfiguration,
    client: Arc<DebugAdapterClient>,
    capabilities: SessionCapabilities,
    cx: SessionContext,
    state: Mutex<State>,
    events: EventEmitter<SessionEvent>,
    _event_task: Task<()>,
}

impl Session {
    /// Creates a session over `transport`. `configuration` is the resolved
    /// form of the configuration in `options`.
    pub fn new(
        id: SessionId,
        options: Arc<DebugSessionOptions>,
        configuration: DebugConfiguration,
        transport: Transport,
        cx: SessionContext,
    ) -> Arc<Self> {
        let capabilities = SessionCapabilities::default();
        let trace_sink = trace_sink(&cx);
        let client = DebugAdapterClient::new(
            id,
            transport,
            Arc::new(capabilities.clone()),
            trace_sink,
            cx.executor.clone(),
        );
        let adapter_events = stream::select(
            client.on_events(EventKind::ALL),
            client.on_custom_events().map(Events::Custom),
        );

        Arc::new_cyclic(|this| Self {
            _event_task: cx
                .executor
                .spawn(Self::handle_events(this.clone(), adapter_events)),
            id,
            options,
            configuration,
            client,
            capabilities,
            cx,
            state: Mutex::new(State {
                state: SessionState::Inactive,
                configuring: false,
                launched: false,
                threads: None,
                stack_frames: HashMap::default(),
                generation: 0,
                stop_count: 0,
                current_thread: None,
                current_frame: None,
                breakpoint_statuses: BTreeMap::default(),
            }),
            events: EventEmitter::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn options(&self) -> &Arc<DebugSessionOptions> {
        &self.options
    }

    pub fn configuration(&self) -> &DebugConfiguration {
        &self.configuration
    }

    pub fn name(&self) -> &str {
        &self.configuration.name
    }

    /// The session name, suffixed with the disambiguation id when another
    /// session with the same name came first.
    pub fn label(&self) -> String {
        match self.options.disambiguation_id() {
            None | Some(0) => self.configuration.name.clone(),
            Some(id) => format!("{} ({id})", self.configuration.name),
        }
    }

    pub fn client(&self) -> &Arc<DebugAdapterClient> {
        &self.client
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().state
    }

    /// Whether breakpoint changes should be sent to the adapter now: from the
    /// start of configuration until the session terminates.
    pub fn accepts_breakpoint_changes(&self) -> bool {
        let state = self.state.lock();
        match state.state {
            SessionState::Initializing => state.configuring,
            state => state.is_configured(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.get()
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.state.lock().current_thread
    }

    pub fn current_frame(&self) -> Option<StackFrame> {
        self.state.lock().current_frame.clone()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SessionEvent> {
        self.events.subscribe()
    }

    fn set_state(&self, new: SessionState) -> bool {
        let old = {
            let mut state = self.state.lock();
            let old = state.state;
            if !old.can_transition_to(new) {
                if old != new {
                    log::debug!("{}: ignoring transition from {old} to {new}", self.id);
                }
                return false;
            }
            state.state = new;
            old
        };
        log::debug!("{}: {old} -> {new}", self.id);
        self.events.emit(SessionEvent::StateChanged { old, new });
        true
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.start_with_restart_data(None).await
    }

    /// Starts the session, handing `restart` back to the adapter as the
    /// `__restart` launch argument.
    pub async fn start_with_restart_data(self: &Arc<Self>, restart: Option<Value>) -> Result<()> {
        if !self.set_state(SessionState::Initializing) {
            bail!("{} was already started", self.id);
        }
        let result = self.initialize_and_launch(restart).await;
        if let Err(error) = &result {
            log::error!("{}: failed to start: {error:?}", self.id);
            self.dispose();
        }
        result
    }

    async fn initialize_and_launch(self: &Arc<Self>, restart: Option<Value>) -> Result<()> {
        let mut initialized = self.client.on_events(&[EventKind::Initialized]);

        let capabilities = self
            .client
            .request::<Initialize>(InitializeArguments {
                client_id: Some("debugger".into()),
                client_name: Some("Debugger".into()),
                adapter_id: self.configuration.adapter.clone(),
                locale: Some("en-US".into()),
                lines_start_at_one: Some(true),
                columns_start_at_one: Some(true),
                path_format: Some("path".into()),
                supports_variable_type: Some(true),
                supports_variable_paging: Some(false),
                supports_run_in_terminal_request: Some(false),
                supports_memory_references: Some(false),
                supports_progress_reporting: Some(false),
                supports_invalidated_event: Some(false),
                supports_start_debugging_request: Some(false),
            })
            .await
            .context("initialize request failed")?;
        if let Some(filters) = &capabilities.exception_breakpoint_filters {
            self.cx.breakpoint_store.set_exception_filters(filters);
        }
        self.capabilities.set(capabilities);
        self.events.emit(SessionEvent::CapabilitiesChanged);

        let arguments = self
            .configuration
            .request_arguments(self.options.no_debug, restart);
        let launch = match self.configuration.request {
            DebugRequestKind::Launch => self.client.request::<Launch>(arguments).boxed_local(),
            DebugRequestKind::Attach => self.client.request::<Attach>(arguments).boxed_local(),
        };
        let mut launch = launch.fuse();
        let command = match self.configuration.request {
            DebugRequestKind::Launch => Launch::COMMAND,
            DebugRequestKind::Attach => Attach::COMMAND,
        };

        // Adapters differ in whether they answer launch before or after
        // configurationDone, so wait for whichever comes first.
        let mut launched = false;
        futures::select_biased! {
            result = launch => {
                result.with_context(|| format!("{command} request failed"))?;
                launched = true;
            }
            event = initialized.next() => {
                if event.is_none() {
                    bail!("debug adapter went away before it was initialized");
                }
            }
        }
        if launched {
            initialized
                .next()
                .await
                .ok_or_else(|| anyhow!("debug adapter went away before it was initialized"))?;
        }

        self.configure().await?;

        if !launched {
            launch
                .await
                .with_context(|| format!("{command} request failed"))?;
        }
        self.state.lock().launched = true;

        if self.state() == SessionState::Initializing {
            self.set_state(SessionState::Running);
        }
        Ok(())
    }

    async fn configure(self: &Arc<Self>) -> Result<()> {
        self.state.lock().configuring = true;
        let store = self.cx.breakpoint_store.clone();
        let source_breakpoints = store
            .uris()
            .into_iter()
            .map(|uri| {
                let breakpoints = store.breakpoints(&uri);
                let this = self.clone();
                async move { this.set_breakpoints(&uri, breakpoints).await.log_err() }
            })
            .collect::<Vec<_>>();
        futures::future::join_all(source_breakpoints).await;

        self.set_function_breakpoints().await.log_err();
        self.set_exception_breakpoints().await.log_err();

        if self.capabilities.read(|capabilities| {
            capabilities
                .supports_configuration_done_request
                .unwrap_or(false)
        }) {
            self.client
                .request::<ConfigurationDone>(())
                .await
                .context("configurationDone request failed")?;
        }
        Ok(())
    }

    async fn handle_events(
        this: Weak<Self>,
        mut events: impl futures::Stream<Item = Events> + Unpin,
    ) {
        while let Some(event) = events.next().await {
            let Some(this) = this.upgrade() else {
                break;
            };
            this.handle_event(event).await;
        }
    }

    async fn handle_event(self: &Arc<Self>, event: Events) {
        match event {
            Events::Initialized(_) => {}
            Events::Stopped(event) => self.handle_stopped(event).await,
            Events::Continued(event) => self.handle_continued(event),
            Events::Terminated(event) => {
                self.handle_terminated(event.and_then(|event| event.restart))
            }
            Events::Exited(event) => self.handle_exited(event),
            Events::Thread(event) => self.handle_thread_event(event),
            Events::Breakpoint(event) => self.handle_breakpoint_event(event),
            Events::Capabilities(CapabilitiesEvent { capabilities }) => {
                if let Some(filters) = &capabilities.exception_breakpoint_filters {
                    self.cx.breakpoint_store.set_exception_filters(filters);
                }
                self.capabilities.merge(capabilities);
                self.events.emit(SessionEvent::CapabilitiesChanged);
            }
            Events::Output(event) => self.events.emit(SessionEvent::Output(event)),
            Events::Custom(event) => self.events.emit(SessionEvent::Custom(event)),
            event => log::trace!("{}: ignoring {} event", self.id, event.name()),
        }
    }

    async fn handle_stopped(self: &Arc<Self>, event: StoppedEvent) {
        if self.state() == SessionState::Terminated {
            return;
        }
        let current_thread = {
            let mut state = self.state.lock();
            state.invalidate();
            state.stop_count.post_inc();
            state.current_thread
        };
        self.set_state(SessionState::Stopped);
        self.events.emit(SessionEvent::Stopped(event.clone()));

        let thread_id = match (event.preserve_focus_hint, current_thread, event.thread_id) {
            (Some(true), Some(current_thread), _) => Some(current_thread),
            (_, _, Some(thread_id)) => Some(thread_id),
            (_, _, None) => self.fallback_thread().await,
        };
        if let Some(thread_id) = thread_id {
            self.select_thread(thread_id).await;
        }
    }

    async fn fallback_thread(self: &Arc<Self>) -> Option<ThreadId> {
        let threads = self.threads().await.log_err()?;
        match self.cx.settings.stopped_thread_fallback {
            ThreadFallback::FirstReported => threads.first().map(|thread| thread.id),
            ThreadFallback::LowestId => threads.iter().map(|thread| thread.id).min(),
        }
    }

    async fn select_thread(self: &Arc<Self>, thread_id: ThreadId) {
        {
            let mut state = self.state.lock();
            state.current_thread = Some(thread_id);
            state.current_frame = None;
        }

        let frame = match self.stack_frames(thread_id).await {
            Ok(frames) => frames.into_iter().next(),
            Err(error) => {
                log::warn!("{}: failed to load stack of thread {thread_id}: {error:#}", self.id);
                None
            }
        };

        {
            let mut state = self.state.lock();
            if state.current_thread != Some(thread_id) {
                return;
            }
            state.current_frame = frame;
        }
        self.events.emit(SessionEvent::CurrentFrameChanged);
    }

    fn handle_continued(&self, event: ContinuedEvent) {
        let all_threads_continued = self.client.all_threads_continued();
        let resumes_current_thread = {
            let mut state = self.state.lock();
            let resumes_current_thread = all_threads_continued
                || event.thread_id.is_none()
                || event.thread_id == state.current_thread;
            if resumes_current_thread {
                state.invalidate();
                state.current_frame = None;
            } else if let Some(thread_id) = event.thread_id {
                state.stack_frames.remove(&thread_id);
            }
            resumes_current_thread
        };
        if resumes_current_thread {
            self.set_state(SessionState::Running);
        }
        self.events.emit(SessionEvent::Continued {
            thread_id: event.thread_id,
            all_threads_continued,
        });
    }

    fn handle_terminated(&self, restart: Option<Value>) {
        if restart.is_none() {
            self.state.lock().invalidate();
            self.set_state(SessionState::Terminated);
        }
        self.events.emit(SessionEvent::Terminated { restart });
    }

    fn handle_exited(&self, event: ExitedEvent) {
        self.set_state(SessionState::Terminated);
        self.clear();
        self.events.emit(SessionEvent::Exited {
            exit_code: event.exit_code,
            reason: event.reason,
        });
        self.client.dispose();
    }

    fn handle_thread_event(&self, event: ThreadEvent) {
        {
            let mut state = self.state.lock();
            match event.reason.as_str() {
                "started" => {
                    if let Some(threads) = state.threads.as_mut() {
                        if !threads.iter().any(|thread| thread.id == event.thread_id) {
                            threads.push(Thread {
                                id: event.thread_id,
                                name: String::new(),
                            });
                        }
                    }
                }
                "exited" => {
                    if let Some(threads) = state.threads.as_mut() {
                        threads.retain(|thread| thread.id != event.thread_id);
                    }
                    state.stack_frames.remove(&event.thread_id);
                    if state.current_thread == Some(event.thread_id) {
                        state.current_thread = None;
                        state.current_frame = None;
                    }
                }
                reason => log::debug!("{}: unknown thread event reason {reason}", self.id),
            }
        }
        self.events.emit(SessionEvent::ThreadsChanged);
    }

    fn handle_breakpoint_event(&self, event: BreakpointEvent) {
        let Some(adapter_id) = event.breakpoint.id else {
            return;
        };
        let uri = {
            let mut state = self.state.lock();
            let mut changed_uri = None;
            for (uri, statuses) in state.breakpoint_statuses.iter_mut() {
                let Some(id) = statuses
                    .iter()
                    .find_map(|(id, status)| (status.adapter_id == Some(adapter_id)).then_some(*id))
                else {
                    continue;
                };
                if event.reason == "removed" {
                    statuses.remove(&id);
                } else if let Some(status) = statuses.get_mut(&id) {
                    status.verified = event.breakpoint.verified;
                    status.message = event.breakpoint.message.clone();
                    if let Some(line) = event.breakpoint.line {
                        status.line = line;
                    }
                    if event.breakpoint.column.is_some() {
                        status.column = event.breakpoint.column;
                    }
                }
                changed_uri = Some(uri.clone());
                break;
            }
            changed_uri
        };

        match uri {
            Some(uri) => self.events.emit(SessionEvent::BreakpointsChanged { uri }),
            None => log::debug!(
                "{}: {} event for unknown breakpoint {adapter_id}",
                self.id,
                event.reason
            ),
        }
    }

    /// The adapter's threads, fetched once per stop.
    pub async fn threads(self: &Arc<Self>) -> Result<Vec<Thread>> {
        let generation = {
            let state = self.state.lock();
            if let Some(threads) = &state.threads {
                return Ok(threads.clone());
            }
            state.generation
        };

        let response = self
            .client
            .request::<Threads>(())
            .await
            .context("threads request failed")?;

        let mut state = self.state.lock();
        if state.generation == generation {
            state.threads = Some(response.threads.clone());
        }
        Ok(response.threads)
    }

    pub async fn stack_frames(self: &Arc<Self>, thread_id: ThreadId) -> Result<Vec<StackFrame>> {
        let generation = {
            let state = self.state.lock();
            if let Some(frames) = state.stack_frames.get(&thread_id) {
                return Ok(frames.clone());
            }
            state.generation
        };

        let response = self
            .client
            .request::<StackTrace>(StackTraceArguments {
                thread_id,
                start_frame: None,
                levels: None,
            })
            .await
            .context("stackTrace request failed")?;

        let mut state = self.state.lock();
        if state.generation == generation {
            state
                .stack_frames
                .insert(thread_id, response.stack_frames.clone());
        }
        Ok(response.stack_frames)
    }

    pub async fn set_current_thread(self: &Arc<Self>, thread_id: ThreadId) {
        self.select_thread(thread_id).await;
    }

    /// Selects one of the current thread's frames. Returns false if the frame
    /// is not on that thread's stack.
    pub fn set_current_frame(&self, frame_id: u64) -> bool {
        {
            let mut state = self.state.lock();
            let Some(frame) = state
                .current_thread
                .and_then(|thread_id| state.stack_frames.get(&thread_id))
                .and_then(|frames| frames.iter().find(|frame| frame.id == frame_id))
                .cloned()
            else {
                return false;
            };
            state.current_frame = Some(frame);
        }
        self.events.emit(SessionEvent::CurrentFrameChanged);
        true
    }

    pub async fn pause(self: &Arc<Self>, thread_id: ThreadId) -> Result<()> {
        self.client
            .request::<Pause>(PauseArguments { thread_id })
            .await
            .context("pause request failed")
    }

    pub async fn continue_thread(self: &Arc<Self>, thread_id: ThreadId) -> Result<()> {
        let stop_count = self.state.lock().stop_count;
        let response = self
            .client
            .request::<Continue>(ContinueArguments {
                thread_id,
                single_thread: None,
            })
            .await
            .context("continue request failed")?;
        if let Some(all_threads_continued) =
            response.and_then(|response| response.all_threads_continued)
        {
            self.client.set_all_threads_continued(all_threads_continued);
        }
        self.did_resume(stop_count);
        Ok(())
    }

    pub async fn next(self: &Arc<Self>, thread_id: ThreadId) -> Result<()> {
        self.step::<Next>(thread_id).await
    }

    pub async fn step_in(self: &Arc<Self>, thread_id: ThreadId) -> Result<()> {
        self.step::<StepIn>(thread_id).await
    }

    pub async fn step_out(self: &Arc<Self>, thread_id: ThreadId) -> Result<()> {
        self.step::<StepOut>(thread_id).await
    }

    pub async fn step_back(self: &Arc<Self>, thread_id: ThreadId) -> Result<()> {
        if !self.capabilities.read(|capabilities| capabilities.supports_step_back.unwrap_or(false))
        {
            bail!("{} does not support stepping back", self.configuration.adapter);
        }
        self.step::<StepBack>(thread_id).await
    }

    async fn step<R>(self: &Arc<Self>, thread_id: ThreadId) -> Result<()>
    where
        R: 'static + Request<Arguments = StepArguments, Response = ()>,
    {
        let granularity = self
            .capabilities
            .read(|capabilities| capabilities.supports_stepping_granularity.unwrap_or(false))
            .then_some(self.cx.settings.stepping_granularity);
        let stop_count = self.state.lock().stop_count;
        self.client
            .request::<R>(StepArguments {
                thread_id,
                single_thread: None,
                granularity,
            })
            .await
            .with_context(|| format!("{} request failed", R::COMMAND))?;
        self.did_resume(stop_count);
        Ok(())
    }

    // A stop that arrived while the request was in flight wins.
    fn did_resume(&self, stop_count: u64) {
        {
            let mut state = self.state.lock();
            if state.stop_count != stop_count {
                return;
            }
            state.invalidate();
            state.current_frame = None;
        }
        self.set_state(SessionState::Running);
    }

    pub async fn evaluate(
        self: &Arc<Self>,
        expression: String,
        frame_id: Option<u64>,
        context: Option<String>,
    ) -> Result<EvaluateResponse> {
        self.client
            .request::<Evaluate>(EvaluateArguments {
                expression,
                frame_id,
                context,
            })
            .await
            .context("evaluate request failed")
    }

    pub async fn scopes(self: &Arc<Self>, frame_id: u64) -> Result<Vec<Scope>> {
        let response = self
            .client
            .request::<Scopes>(ScopesArguments { frame_id })
            .await
            .context("scopes request failed")?;
        Ok(response.scopes)
    }

    pub async fn variables(self: &Arc<Self>, variables_reference: u64) -> Result<Vec<Variable>> {
        let response = self
            .client
            .request::<Variables>(VariablesArguments {
                variables_reference,
                filter: None,
                start: None,
                count: None,
            })
            .await
            .context("variables request failed")?;
        Ok(response.variables)
    }

    /// Sends the breakpoints of `uri` that should be armed: disabled ones are
    /// left out, and nothing is sent while breakpoints are deactivated. If the
    /// adapter rejects the request, the previously sent set stays in effect.
    pub async fn set_breakpoints(
        self: &Arc<Self>,
        uri: &Uri,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> Result<()> {
        let activated = self.cx.breakpoint_store.breakpoints_activated();
        let breakpoints = breakpoints
            .into_iter()
            .filter(|breakpoint| activated && breakpoint.enabled)
            .collect();
        self.send_breakpoints(uri, breakpoints).await
    }

    async fn send_breakpoints(
        self: &Arc<Self>,
        uri: &Uri,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> Result<()> {
        let response = self
            .client
            .request::<SetBreakpoints>(SetBreakpointsArguments {
                source: Source {
                    name: uri.file_name().map(ToString::to_string),
                    path: Some(uri.path().to_string()),
                    ..Default::default()
                },
                breakpoints: Some(
                    breakpoints
                        .iter()
                        .map(SourceBreakpoint::to_protocol)
                        .collect(),
                ),
                source_modified: Some(false),
            })
            .await
            .with_context(|| format!("setting breakpoints of {uri}"))?;

        let statuses = breakpoints
            .iter()
            .enumerate()
            .map(|(ix, breakpoint)| {
                let actual = response.breakpoints.get(ix);
                let status = RuntimeBreakpointStatus {
                    breakpoint_id: breakpoint.id(),
                    verified: actual.is_some_and(|actual| actual.verified),
                    message: actual.and_then(|actual| actual.message.clone()),
                    line: actual
                        .and_then(|actual| actual.line)
                        .unwrap_or(breakpoint.line),
                    column: actual
                        .and_then(|actual| actual.column)
                        .or(breakpoint.column),
                    adapter_id: actual.and_then(|actual| actual.id),
                };
                (breakpoint.id(), status)
            })
            .collect::<HashMap<_, _>>();
        self.state
            .lock()
            .breakpoint_statuses
            .insert(uri.clone(), statuses);
        self.events
            .emit(SessionEvent::BreakpointsChanged { uri: uri.clone() });
        Ok(())
    }

    pub async fn add_breakpoint(self: &Arc<Self>, breakpoint: SourceBreakpoint) -> Result<()> {
        let uri = breakpoint.uri.clone();
        let mut breakpoints = self.cx.breakpoint_store.breakpoints(&uri);
        if !breakpoints
            .iter()
            .any(|existing| existing.id() == breakpoint.id())
        {
            breakpoints.push(breakpoint);
            breakpoints.sort_by_key(|breakpoint| (breakpoint.line, breakpoint.column));
        }
        self.set_breakpoints(&uri, breakpoints).await
    }

    pub async fn del_breakpoint(self: &Arc<Self>, uri: &Uri, id: BreakpointId) -> Result<()> {
        let mut breakpoints = self.cx.breakpoint_store.breakpoints(uri);
        breakpoints.retain(|breakpoint| breakpoint.id() != id);
        self.set_breakpoints(uri, breakpoints).await
    }

    pub async fn set_function_breakpoints(self: &Arc<Self>) -> Result<()> {
        if !self.capabilities.read(|capabilities| {
            capabilities.supports_function_breakpoints.unwrap_or(false)
        }) {
            return Ok(());
        }
        let store = &self.cx.breakpoint_store;
        let activated = store.breakpoints_activated();
        let breakpoints = store
            .function_breakpoints()
            .iter()
            .filter(|breakpoint| activated && breakpoint.enabled)
            .map(|breakpoint| breakpoint.to_protocol())
            .collect();
        self.client
            .request::<SetFunctionBreakpoints>(SetFunctionBreakpointsArguments { breakpoints })
            .await
            .context("setFunctionBreakpoints request failed")?;
        Ok(())
    }

    pub async fn set_exception_breakpoints(self: &Arc<Self>) -> Result<()> {
        let Some(supported) = self.capabilities.read(|capabilities| {
            capabilities
                .exception_breakpoint_filters
                .as_ref()
                .filter(|filters| !filters.is_empty())
                .map(|filters| {
                    filters
                        .iter()
                        .map(|filter| filter.filter.clone())
                        .collect::<BTreeSet<_>>()
                })
        }) else {
            return Ok(());
        };
        let filters = self
            .cx
            .breakpoint_store
            .enabled_exception_filters()
            .into_iter()
            .filter(|filter| supported.contains(filter))
            .collect();
        self.client
            .request::<SetExceptionBreakpoints>(SetExceptionBreakpointsArguments { filters })
            .await
            .context("setExceptionBreakpoints request failed")?;
        Ok(())
    }

    /// The store's breakpoints for `uri` (or every uri), each with what this
    /// session's adapter reported for it.
    pub fn breakpoints(&self, uri: Option<&Uri>) -> Vec<DebugBreakpoint> {
        let store = &self.cx.breakpoint_store;
        let uris = match uri {
            Some(uri) => vec![uri.clone()],
            None => store.uris(),
        };
        let state = self.state.lock();
        uris.iter()
            .flat_map(|uri| {
                let statuses = state.breakpoint_statuses.get(uri);
                store
                    .breakpoints(uri)
                    .into_iter()
                    .map(move |breakpoint| DebugBreakpoint {
                        status: statuses
                            .and_then(|statuses| statuses.get(&breakpoint.id()))
                            .cloned(),
                        breakpoint,
                    })
            })
            .collect()
    }

    /// Documents for which this session holds breakpoint statuses.
    pub fn breakpoint_uris(&self) -> Vec<Uri> {
        self.state
            .lock()
            .breakpoint_statuses
            .iter()
            .filter(|(_, statuses)| !statuses.is_empty())
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    /// Asks the adapter to restart in place. Returns false if the adapter
    /// cannot, in which case the caller falls back to a fresh session.
    pub async fn restart(self: &Arc<Self>) -> bool {
        if !self
            .capabilities
            .read(|capabilities| capabilities.supports_restart_request.unwrap_or(false))
        {
            return false;
        }
        let arguments = self
            .configuration
            .request_arguments(self.options.no_debug, None);
        match self
            .client
            .request::<Restart>(RestartArguments {
                arguments: Some(arguments),
            })
            .await
        {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    state.invalidate();
                    state.current_frame = None;
                }
                self.set_state(SessionState::Running);
                true
            }
            Err(error) => {
                log::warn!("{}: restart request failed: {error}", self.id);
                false
            }
        }
    }

    /// Ends the debuggee. Waits for the adapter's acknowledgement for at most
    /// the configured timeout.
    pub async fn terminate(self: &Arc<Self>, restart: Option<Value>) -> Result<()> {
        if self.client.is_disposed() {
            return Ok(());
        }
        let restart = restart.is_some().then_some(true);
        let use_terminate = self.configuration.request == DebugRequestKind::Launch
            && self.state.lock().launched
            && self
                .capabilities
                .read(|capabilities| capabilities.supports_terminate_request.unwrap_or(false));

        let request = if use_terminate {
            self.client
                .request::<Terminate>(TerminateArguments { restart })
                .boxed_local()
        } else {
            self.client
                .request::<Disconnect>(DisconnectArguments {
                    restart,
                    terminate_debuggee: Some(true),
                    suspend_debuggee: None,
                })
                .boxed_local()
        };
        let mut request = request.fuse();
        let mut timeout = futures::FutureExt::fuse(
            self.cx
                .executor
                .timer(Duration::from_millis(self.cx.settings.timeout)),
        );

        futures::select_biased! {
            result = request => result.context("failed to end the debuggee")?,
            _ = timeout => log::warn!("{}: debug adapter did not acknowledge termination", self.id),
        }
        Ok(())
    }

    /// Continues until the current thread reaches `line` of `uri`, with every
    /// user breakpoint muted on the way. The user breakpoints are restored
    /// however this returns.
    pub async fn run_to_location(self: &Arc<Self>, uri: &Uri, line: u32) -> Result<()> {
        let thread_id = {
            let state = self.state.lock();
            if state.state != SessionState::Stopped {
                bail!("{} is not stopped", self.id);
            }
            state
                .current_thread
                .ok_or_else(|| anyhow!("{} has no current thread", self.id))?
        };

        let mut uris = self
            .cx
            .breakpoint_store
            .uris()
            .into_iter()
            .chain(self.breakpoint_uris())
            .collect::<BTreeSet<_>>();
        uris.insert(uri.clone());
        let _restore = RestoreBreakpoints {
            session: self.clone(),
            uris: uris.clone(),
        };

        for other in uris.iter().filter(|other| *other != uri) {
            self.send_breakpoints(other, Vec::new()).await?;
        }
        self.send_breakpoints(uri, vec![SourceBreakpoint::new(uri.clone(), line)])
            .await?;

        let mut events = self.subscribe();
        self.continue_thread(thread_id).await?;
        while let Some(event) = events.next().await {
            match event {
                SessionEvent::Stopped(_)
                | SessionEvent::Terminated { .. }
                | SessionEvent::Exited { .. }
                | SessionEvent::StateChanged {
                    new: SessionState::Terminated,
                    ..
                } => break,
                _ => {}
            }
        }
        Ok(())
    }

    /// Moves to Terminated and tears down the connection. Does not talk to
    /// the adapter.
    pub fn dispose(&self) {
        self.set_state(SessionState::Terminated);
        self.clear();
        self.client.dispose();
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.invalidate();
        state.current_thread = None;
        state.current_frame = None;
        state.breakpoint_statuses.clear();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.configuration.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct RestoreBreakpoints {
    session: Arc<Session>,
    uris: BTreeSet<Uri>,
}

impl Drop for RestoreBreakpoints {
    fn drop(&mut self) {
        let session = self.session.clone();
        let uris = mem::take(&mut self.uris);
        self.session
            .cx
            .executor
            .spawn(async move {
                for uri in uris {
                    if session.client.is_disposed() {
                        break;
                    }
                    let breakpoints = session.cx.breakpoint_store.breakpoints(&uri);
                    session.set_breakpoints(&uri, breakpoints).await.log_err();
                }
            })
            .detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dap::FakeAdapter;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn session(executor: &ForegroundExecutor) -> (FakeAdapter, Arc<Session>) {
        let (fake, transport) = FakeAdapter::new();
        let configuration = DebugConfiguration::new("test", "fake", DebugRequestKind::Launch);
        let session = Session::new(
            SessionId(0),
            Arc::new(DebugSessionOptions::new(configuration.clone())),
            configuration,
            transport,
            SessionContext {
                breakpoint_store: Arc::new(BreakpointStore::new()),
                settings: DebuggerSettings::default(),
                executor: executor.clone(),
                trace_sink: None,
            },
        );
        (fake, session)
    }

    fn states(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionState> {
        let mut states = Vec::new();
        while let Ok(Some(event)) = events.try_next() {
            if let SessionEvent::StateChanged { new, .. } = event {
                states.push(new);
            }
        }
        states
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Inactive.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(!Inactive.can_transition_to(Running));
        assert!(!Inactive.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Initializing));
        for state in [Inactive, Initializing, Running, Stopped, Terminated] {
            assert!(!Terminated.can_transition_to(state));
            assert!(!state.can_transition_to(state));
        }
    }

    #[test]
    fn test_start_configures_in_order() {
        let executor = ForegroundExecutor::new();
        let (fake, session) = session(&executor);
        fake.handshake(Capabilities {
            supports_configuration_done_request: Some(true),
            supports_function_breakpoints: Some(true),
            ..Default::default()
        });
        let store = session.cx.breakpoint_store.clone();
        let uri = Uri::from("/src/main.rs");
        store.add_breakpoint(SourceBreakpoint::new(uri.clone(), 3));
        store.add_breakpoint(SourceBreakpoint {
            enabled: false,
            ..SourceBreakpoint::new(uri.clone(), 9)
        });
        let mut events = session.subscribe();

        executor.block_on(session.start()).unwrap();

        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(
            states(&mut events),
            vec![SessionState::Initializing, SessionState::Running]
        );
        assert_eq!(
            fake.received_commands(),
            vec![
                "initialize",
                "launch",
                "setBreakpoints",
                "setFunctionBreakpoints",
                "configurationDone"
            ]
        );
        let set_breakpoints = &fake.requests_for("setBreakpoints")[0];
        assert_eq!(
            set_breakpoints.arguments.as_ref().unwrap()["breakpoints"],
            json!([{ "line": 3 }])
        );

        let breakpoints = session.breakpoints(Some(&uri));
        assert_eq!(breakpoints.len(), 2);
        assert!(breakpoints[0].is_verified());
        assert_eq!(breakpoints[1].status, None);
    }

    #[test]
    fn test_failed_launch_terminates_the_session() {
        let executor = ForegroundExecutor::new();
        let (fake, session) = session(&executor);
        fake.handshake(Capabilities::default());
        fake.on_custom_request("launch", |_| dap::FakeReply::Failure("no program".into()));

        let error = executor.block_on(session.start()).unwrap_err();
        assert!(format!("{error:#}").contains("no program"));
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.client().is_disposed());
        assert!(executor.block_on(session.start()).is_err());
    }

    #[test]
    fn test_stopped_without_thread_uses_fallback() {
        let executor = ForegroundExecutor::new();
        let (fake, session) = session(&executor);
        fake.handshake(Capabilities::default());
        fake.on_request::<Threads, _>(|_| {
            Ok(dap::requests::ThreadsResponse {
                threads: vec![
                    Thread {
                        id: ThreadId(7),
                        name: "worker".into(),
                    },
                    Thread {
                        id: ThreadId(2),
                        name: "main".into(),
                    },
                ],
            })
        });
        fake.on_request::<StackTrace, _>(|arguments| {
            Ok(dap::requests::StackTraceResponse {
                total_frames: None,
                stack_frames: vec![StackFrame {
                    id: arguments.thread_id.0 * 100,
                    name: "frame".into(),
                    source: None,
                    line: 1,
                    column: 1,
                    end_line: None,
                    end_column: None,
                    can_restart: None,
                    instruction_pointer_reference: None,
                    module_id: None,
                    presentation_hint: None,
                }],
            })
        });
        executor.block_on(session.start()).unwrap();

        fake.fake_event("stopped", json!({ "reason": "pause" }));
        executor.run_until_parked();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.current_thread(), Some(ThreadId(7)));
        assert_eq!(session.current_frame().map(|frame| frame.id), Some(700));

        fake.fake_event("continued", json!({ "threadId": 7 }));
        executor.run_until_parked();
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.current_frame(), None);
    }

    #[test]
    fn test_step_back_requires_capability() {
        let executor = ForegroundExecutor::new();
        let (fake, session) = session(&executor);
        fake.handshake(Capabilities::default());
        executor.block_on(session.start()).unwrap();

        assert!(executor.block_on(session.step_back(ThreadId(1))).is_err());
        assert!(fake.requests_for("stepBack").is_empty());
    }

    #[test]
    fn test_exited_is_absorbing() {
        let executor = ForegroundExecutor::new();
        let (fake, session) = session(&executor);
        fake.handshake(Capabilities::default());
        executor.block_on(session.start()).unwrap();
        let mut events = session.subscribe();

        fake.fake_event("exited", json!({ "exitCode": 0 }));
        fake.fake_event("stopped", json!({ "reason": "step", "threadId": 1 }));
        executor.run_until_parked();

        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(states(&mut events), vec![SessionState::Terminated]);
        assert!(session.client().is_disposed());
        assert!(fake.is_closed());
    }

    #[test]
    fn test_terminate_prefers_terminate_request() {
        let executor = ForegroundExecutor::new();
        let (fake, session) = session(&executor);
        fake.handshake(Capabilities {
            supports_terminate_request: Some(true),
            ..Default::default()
        });
        executor.block_on(session.start()).unwrap();

        executor.block_on(session.terminate(None)).unwrap();
        assert_eq!(fake.requests_for("terminate").len(), 1);
        assert!(fake.requests_for("disconnect").is_empty());
    }

    #[test]
    fn test_terminate_times_out() {
        let executor = ForegroundExecutor::new();
        let (fake, transport) = FakeAdapter::new();
        let configuration = DebugConfiguration::new("test", "fake", DebugRequestKind::Attach);
        let session = Session::new(
            SessionId(0),
            Arc::new(DebugSessionOptions::new(configuration.clone())),
            configuration,
            transport,
            SessionContext {
                breakpoint_store: Arc::new(BreakpointStore::new()),
                settings: DebuggerSettings {
                    timeout: 10,
                    ..Default::default()
                },
                executor: executor.clone(),
                trace_sink: None,
            },
        );
        fake.handshake(Capabilities::default());
        fake.hold_requests("disconnect");
        executor.block_on(session.start()).unwrap();

        executor.block_on(session.terminate(None)).unwrap();
        let disconnect = &fake.requests_for("disconnect")[0];
        assert_eq!(
            disconnect.arguments,
            Some(json!({ "terminateDebuggee": true }))
        );
    }

    #[test]
    fn test_lifecycle_events_with_missing_fields() {
        let executor = ForegroundExecutor::new();
        let (fake, session) = session(&executor);
        fake.handshake(Capabilities::default());
        fake.on_request::<StackTrace, _>(|_| Ok(dap::requests::StackTraceResponse::default()));
        executor.block_on(session.start()).unwrap();

        fake.fake_event("stopped", json!({ "threadId": 1 }));
        executor.run_until_parked();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.current_thread(), Some(ThreadId(1)));

        fake.fake_event("exited", json!({}));
        executor.run_until_parked();
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.client().is_disposed());
    }

    #[test]
    fn test_trace_sink_follows_settings() {
        use dap::IoKind;

        struct NullSink;

        impl TraceSink for NullSink {
            fn trace(&self, _: SessionId, _: IoKind, _: &str) {}
        }

        let mut cx = SessionContext {
            breakpoint_store: Arc::new(BreakpointStore::new()),
            settings: DebuggerSettings::default(),
            executor: ForegroundExecutor::new(),
            trace_sink: None,
        };
        assert!(trace_sink(&cx).is_some());

        let sink: Arc<dyn TraceSink> = Arc::new(NullSink);
        cx.trace_sink = Some(sink.clone());
        assert!(Arc::ptr_eq(&trace_sink(&cx).unwrap(), &sink));

        cx.settings.log_dap_communications = false;
        assert!(trace_sink(&cx).is_none());
    }
}

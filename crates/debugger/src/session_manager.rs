use crate::{
    breakpoint_store::{BreakpointStore, Uri},
    configuration::{ConfigurationResolver, DebugConfiguration, DebugSessionOptions},
    debounced_delay::DebouncedDelay,
    persistence::KeyValueStore,
    session::{DebugBreakpoint, Session, SessionContext, SessionEvent, SessionState},
};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use dap::{events::OutputEvent, SessionId, StackFrame, ThreadId, Transport};
use futures::{channel::mpsc::UnboundedReceiver, future::join_all, stream, Stream, StreamExt as _};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use smol::Task;
use std::{
    collections::{BTreeSet, HashMap},
    mem,
    sync::{Arc, Weak},
    time::Duration,
};
use util::{EventEmitter, PostInc, ResultExt as _};

#[derive(Clone, Debug, PartialEq)]
pub enum SessionManagerEvent {
    DidStartSession(SessionId),
    DidStopSession(SessionId),
    DidChangeSessionState {
        session_id: SessionId,
        state: SessionState,
    },
    DidTerminateSession(SessionId),
    DidChangeCurrentSession {
        old: Option<SessionId>,
        new: Option<SessionId>,
    },
    DidChangeCurrentFrame,
    DidChangeBreakpoints {
        uri: Uri,
    },
    StartFailed {
        name: String,
        message: String,
    },
    Output {
        session_id: SessionId,
        output: OutputEvent,
    },
}

/// Creates sessions for one configuration type.
pub trait SessionFactory {
    fn create(
        &self,
        id: SessionId,
        options: Arc<DebugSessionOptions>,
        configuration: DebugConfiguration,
        cx: SessionContext,
    ) -> Result<Arc<Session>>;
}

/// A factory that only needs to know how to reach the adapter.
pub struct TransportSessionFactory<F> {
    connect: F,
}

impl<F> TransportSessionFactory<F>
where
    F: Fn(&DebugConfiguration) -> Result<Transport>,
{
    pub fn new(connect: F) -> Self {
        Self { connect }
    }
}

impl<F> SessionFactory for TransportSessionFactory<F>
where
    F: Fn(&DebugConfiguration) -> Result<Transport>,
{
    fn create(
        &self,
        id: SessionId,
        options: Arc<DebugSessionOptions>,
        configuration: DebugConfiguration,
        cx: SessionContext,
    ) -> Result<Arc<Session>> {
        let transport = (self.connect)(&configuration)
            .with_context(|| format!("connecting to {} debug adapter", configuration.adapter))?;
        Ok(Session::new(id, options, configuration, transport, cx))
    }
}

/// Runs before a session is created, for example to build the debuggee.
/// Returning an error vetoes the start.
#[async_trait(?Send)]
pub trait WillStartSessionHook {
    async fn will_start_session(&self, options: &DebugSessionOptions) -> Result<()>;
}

struct RegisteredSession {
    session: Arc<Session>,
    _listener: Task<()>,
}

struct ManagerState {
    sessions: IndexMap<SessionId, RegisteredSession>,
    next_session_id: u32,
    current_session: Option<SessionId>,
    pinned: bool,
    pending_breakpoint_notifications: BTreeSet<Uri>,
    notification_delay: DebouncedDelay,
    save_delay: DebouncedDelay,
}

enum StoreChange {
    Breakpoints(Uri),
    FunctionBreakpoints,
    ExceptionBreakpoints,
    Activation,
}

/// Owns every live session, tracks which one is current and keeps sessions
/// in sync with the breakpoint store.
pub struct SessionManager {
    cx: SessionContext,
    resolver: Arc<dyn ConfigurationResolver>,
    kvp: Option<Arc<dyn KeyValueStore>>,
    factories: Mutex<HashMap<String, Arc<dyn SessionFactory>>>,
    hooks: Mutex<Vec<Arc<dyn WillStartSessionHook>>>,
    state: Mutex<ManagerState>,
    events: EventEmitter<SessionManagerEvent>,
    _store_changes: Task<()>,
}

impl SessionManager {
    pub fn new(
        cx: SessionContext,
        resolver: Arc<dyn ConfigurationResolver>,
        kvp: Option<Arc<dyn KeyValueStore>>,
    ) -> Arc<Self> {
        let store = &cx.breakpoint_store;
        let store_changes = stream::select_all([
            store
                .subscribe()
                .map(|change| StoreChange::Breakpoints(change.uri))
                .boxed_local(),
            store
                .subscribe_function_breakpoints()
                .map(|_| StoreChange::FunctionBreakpoints)
                .boxed_local(),
            store
                .subscribe_exception_breakpoints()
                .map(|_| StoreChange::ExceptionBreakpoints)
                .boxed_local(),
            store
                .subscribe_activation()
                .map(|_| StoreChange::Activation)
                .boxed_local(),
        ]);

        Arc::new_cyclic(|this| Self {
            _store_changes: cx
                .executor
                .spawn(Self::relay_store_changes(this.clone(), store_changes)),
            cx,
            resolver,
            kvp,
            factories: Mutex::default(),
            hooks: Mutex::default(),
            state: Mutex::new(ManagerState {
                sessions: IndexMap::default(),
                next_session_id: 0,
                current_session: None,
                pinned: false,
                pending_breakpoint_notifications: BTreeSet::new(),
                notification_delay: DebouncedDelay::new(),
                save_delay: DebouncedDelay::new(),
            }),
            events: EventEmitter::new(),
        })
    }

    pub fn breakpoint_store(&self) -> &Arc<BreakpointStore> {
        &self.cx.breakpoint_store
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SessionManagerEvent> {
        self.events.subscribe()
    }

    pub fn register_factory(&self, adapter: impl Into<String>, factory: Arc<dyn SessionFactory>) {
        self.factories.lock().insert(adapter.into(), factory);
    }

    /// Hooks run in registration order.
    pub fn add_will_start_hook(&self, hook: Arc<dyn WillStartSessionHook>) {
        self.hooks.lock().push(hook);
    }

    pub async fn load_breakpoints(&self) -> Result<()> {
        match self.kvp.as_ref() {
            Some(kvp) => self.cx.breakpoint_store.load(kvp.as_ref()).await,
            None => Ok(()),
        }
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.state
            .lock()
            .sessions
            .values()
            .map(|registered| registered.session.clone())
            .collect()
    }

    pub fn session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.state
            .lock()
            .sessions
            .get(&session_id)
            .map(|registered| registered.session.clone())
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        let state = self.state.lock();
        state
            .current_session
            .and_then(|id| state.sessions.get(&id))
            .map(|registered| registered.session.clone())
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current_session()?.current_thread()
    }

    pub fn current_frame(&self) -> Option<StackFrame> {
        self.current_session()?.current_frame()
    }

    /// Starts a session for `options`. Returns `None` when the configuration
    /// resolver cancelled the start.
    pub async fn start(
        self: &Arc<Self>,
        options: Arc<DebugSessionOptions>,
    ) -> Result<Option<SessionId>> {
        self.start_internal(options, None).await
    }

    async fn start_internal(
        self: &Arc<Self>,
        options: Arc<DebugSessionOptions>,
        restart: Option<Value>,
    ) -> Result<Option<SessionId>> {
        let session = match self.create_session(&options).await {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(None),
            Err(error) => {
                self.start_failed(&options, &error);
                return Err(error);
            }
        };

        let session_id = session.id();
        if let Err(error) = session.start_with_restart_data(restart).await {
            self.start_failed(&options, &error);
            self.destroy(session_id);
            return Err(error);
        }
        Ok(Some(session_id))
    }

    fn start_failed(&self, options: &DebugSessionOptions, error: &anyhow::Error) {
        log::error!(
            "failed to start debug session {}: {error:?}",
            options.configuration.name
        );
        self.events.emit(SessionManagerEvent::StartFailed {
            name: options.configuration.name.clone(),
            message: format!("{error:#}"),
        });
    }

    async fn create_session(
        self: &Arc<Self>,
        options: &Arc<DebugSessionOptions>,
    ) -> Result<Option<Arc<Session>>> {
        let hooks = self.hooks.lock().clone();
        for hook in hooks {
            hook.will_start_session(options).await?;
        }

        let Some(configuration) = self
            .resolver
            .resolve(options.configuration.clone(), options.workspace.as_deref())
            .await
            .context("resolving debug configuration")?
        else {
            log::info!(
                "starting debug session {} was cancelled",
                options.configuration.name
            );
            return Ok(None);
        };

        let factory = self
            .factories
            .lock()
            .get(&configuration.adapter)
            .cloned()
            .ok_or_else(|| anyhow!("no debug adapter registered for type {}", configuration.adapter))?;

        let session_id = {
            let mut state = self.state.lock();
            options.get_or_init_disambiguation_id(|| {
                let taken = state
                    .sessions
                    .values()
                    .map(|registered| registered.session.options())
                    .filter(|other| {
                        other.configuration.name == options.configuration.name
                            && other.workspace == options.workspace
                    })
                    .filter_map(|other| other.disambiguation_id())
                    .collect::<BTreeSet<_>>();
                (0..).find(|id| !taken.contains(id)).unwrap_or_default()
            });
            SessionId(state.next_session_id.post_inc())
        };

        let session = factory.create(session_id, options.clone(), configuration, self.cx.clone())?;
        let listener = self.cx.executor.spawn(Self::listen(
            Arc::downgrade(self),
            session_id,
            session.subscribe(),
        ));
        self.state.lock().sessions.insert(
            session_id,
            RegisteredSession {
                session: session.clone(),
                _listener: listener,
            },
        );
        log::info!("started {} ({})", session_id, session.label());
        self.events
            .emit(SessionManagerEvent::DidStartSession(session_id));
        self.update_current_session(BTreeSet::new());
        Ok(Some(session))
    }

    async fn listen(
        this: Weak<Self>,
        session_id: SessionId,
        mut events: UnboundedReceiver<SessionEvent>,
    ) {
        while let Some(event) = events.next().await {
            let Some(this) = this.upgrade() else {
                break;
            };
            this.handle_session_event(session_id, event);
        }
    }

    fn handle_session_event(self: &Arc<Self>, session_id: SessionId, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { new, .. } => {
                self.events.emit(SessionManagerEvent::DidChangeSessionState {
                    session_id,
                    state: new,
                });
                if new == SessionState::Stopped {
                    self.events
                        .emit(SessionManagerEvent::DidStopSession(session_id));
                }
                if new == SessionState::Terminated {
                    self.destroy_later(session_id);
                }
                self.update_current_session(BTreeSet::new());
            }
            SessionEvent::Terminated {
                restart: Some(restart),
            } => {
                let this = self.clone();
                self.cx
                    .executor
                    .spawn(async move {
                        this.restart_internal(session_id, Some(restart))
                            .await
                            .log_err();
                    })
                    .detach();
            }
            SessionEvent::Terminated { restart: None } | SessionEvent::Exited { .. } => {
                self.destroy_later(session_id)
            }
            SessionEvent::CurrentFrameChanged => {
                if self.is_current(session_id) {
                    self.events.emit(SessionManagerEvent::DidChangeCurrentFrame);
                }
            }
            SessionEvent::BreakpointsChanged { uri } => {
                if self.is_current(session_id) {
                    self.notify_breakpoints_changed([uri]);
                }
            }
            SessionEvent::Output(output) => {
                self.events
                    .emit(SessionManagerEvent::Output { session_id, output })
            }
            _ => {}
        }
    }

    fn is_current(&self, session_id: SessionId) -> bool {
        self.state.lock().current_session == Some(session_id)
    }

    // The listener task of a session must not drop itself.
    fn destroy_later(self: &Arc<Self>, session_id: SessionId) {
        let this = self.clone();
        self.cx
            .executor
            .spawn(async move { this.destroy(session_id) })
            .detach();
    }

    /// Disposes the session and forgets it, without talking to the adapter.
    pub fn destroy(self: &Arc<Self>, session_id: SessionId) {
        let Some(registered) = self.state.lock().sessions.shift_remove(&session_id) else {
            return;
        };
        let uris = registered
            .session
            .breakpoint_uris()
            .into_iter()
            .collect::<BTreeSet<_>>();
        registered.session.dispose();
        log::info!("destroyed {session_id}");
        self.events
            .emit(SessionManagerEvent::DidTerminateSession(session_id));
        self.update_current_session(uris);
        drop(registered);
    }

    /// Ends the debuggee of the session, then destroys it.
    pub async fn terminate(self: &Arc<Self>, session_id: SessionId) -> Result<()> {
        let session = self
            .session(session_id)
            .ok_or_else(|| anyhow!("unknown debug session {session_id}"))?;
        let result = session.terminate(None).await;
        self.destroy(session_id);
        result
    }

    /// Restarts the session in place if the adapter can, otherwise replaces it
    /// with a fresh session for the same options.
    pub async fn restart(self: &Arc<Self>, session_id: SessionId) -> Result<Option<SessionId>> {
        self.restart_internal(session_id, None).await
    }

    async fn restart_internal(
        self: &Arc<Self>,
        session_id: SessionId,
        restart: Option<Value>,
    ) -> Result<Option<SessionId>> {
        let session = self
            .session(session_id)
            .ok_or_else(|| anyhow!("unknown debug session {session_id}"))?;
        if session.restart().await {
            return Ok(Some(session_id));
        }

        log::info!("{session_id}: relaunching in a new session");
        session.terminate(restart.clone()).await.log_err();
        self.destroy(session_id);
        self.start_internal(session.options().clone(), restart)
            .await
    }

    /// Makes `session_id` current and keeps it current until it ends. `None`
    /// goes back to following the first live session.
    pub fn set_current_session(self: &Arc<Self>, session_id: Option<SessionId>) -> Result<()> {
        let old = {
            let mut state = self.state.lock();
            if let Some(session_id) = session_id {
                if !state.sessions.contains_key(&session_id) {
                    return Err(anyhow!("unknown debug session {session_id}"));
                }
            }
            state.pinned = session_id.is_some();
            let old = state.current_session;
            if session_id.is_some() {
                state.current_session = session_id;
            }
            old
        };
        match session_id {
            Some(new) if old != Some(new) => {
                self.did_change_current_session(old, Some(new), BTreeSet::new())
            }
            Some(_) => {}
            None => self.update_current_session(BTreeSet::new()),
        }
        Ok(())
    }

    fn update_current_session(self: &Arc<Self>, affected_uris: BTreeSet<Uri>) {
        let (old, new) = {
            let mut state = self.state.lock();
            let old = state.current_session;
            let current_is_live = old.is_some_and(|id| state.sessions.contains_key(&id));
            let new = if state.pinned && current_is_live {
                old
            } else {
                state.pinned = false;
                state.sessions.keys().next().copied()
            };
            state.current_session = new;
            (old, new)
        };
        if old != new {
            self.did_change_current_session(old, new, affected_uris);
        }
    }

    fn did_change_current_session(
        self: &Arc<Self>,
        old: Option<SessionId>,
        new: Option<SessionId>,
        mut uris: BTreeSet<Uri>,
    ) {
        for session in [old, new]
            .into_iter()
            .flatten()
            .filter_map(|id| self.session(id))
        {
            uris.extend(session.breakpoint_uris());
        }
        log::debug!("current debug session changed from {old:?} to {new:?}");
        self.events
            .emit(SessionManagerEvent::DidChangeCurrentSession { old, new });
        self.events.emit(SessionManagerEvent::DidChangeCurrentFrame);
        self.notify_breakpoints_changed(uris);
    }

    /// Breakpoints of `uri` (or every uri) as seen by `session`, or by the
    /// current session when none is given. Without a configured session this
    /// is the store's raw view.
    pub fn breakpoints(&self, uri: Option<&Uri>, session: Option<SessionId>) -> Vec<DebugBreakpoint> {
        let current_session = self.state.lock().current_session;
        let session = session
            .or(current_session)
            .and_then(|id| self.session(id))
            .filter(|session| session.state().is_configured());
        if let Some(session) = session {
            return session.breakpoints(uri);
        }

        let store = &self.cx.breakpoint_store;
        let uris = match uri {
            Some(uri) => vec![uri.clone()],
            None => store.uris(),
        };
        uris.iter()
            .flat_map(|uri| store.breakpoints(uri))
            .map(|breakpoint| DebugBreakpoint {
                breakpoint,
                status: None,
            })
            .collect()
    }

    fn notify_breakpoints_changed(self: &Arc<Self>, uris: impl IntoIterator<Item = Uri>) {
        let delay = self.cx.settings.notification_delay_ms;
        if delay == 0 {
            for uri in uris.into_iter().collect::<BTreeSet<_>>() {
                self.events
                    .emit(SessionManagerEvent::DidChangeBreakpoints { uri });
            }
            return;
        }

        let mut state = self.state.lock();
        state.pending_breakpoint_notifications.extend(uris);
        let this = Arc::downgrade(self);
        state.notification_delay.fire_new(
            Duration::from_millis(delay),
            &self.cx.executor,
            move || async move {
                if let Some(this) = this.upgrade() {
                    this.flush_breakpoint_notifications();
                }
            },
        );
    }

    fn flush_breakpoint_notifications(&self) {
        let uris = mem::take(&mut self.state.lock().pending_breakpoint_notifications);
        for uri in uris {
            self.events
                .emit(SessionManagerEvent::DidChangeBreakpoints { uri });
        }
    }

    fn schedule_save(&self) {
        if !self.cx.settings.save_breakpoints {
            return;
        }
        let Some(kvp) = self.kvp.clone() else {
            return;
        };
        let store = self.cx.breakpoint_store.clone();
        self.state.lock().save_delay.fire_new(
            Duration::from_millis(self.cx.settings.notification_delay_ms),
            &self.cx.executor,
            move || async move {
                store.save(kvp.as_ref()).await.log_err();
            },
        );
    }

    async fn relay_store_changes(
        this: Weak<Self>,
        mut changes: impl Stream<Item = StoreChange> + Unpin,
    ) {
        while let Some(change) = changes.next().await {
            let Some(this) = this.upgrade() else {
                break;
            };
            this.did_change_store(change).await;
        }
    }

    async fn did_change_store(self: &Arc<Self>, change: StoreChange) {
        let sessions = self
            .sessions()
            .into_iter()
            .filter(|session| session.accepts_breakpoint_changes())
            .collect::<Vec<_>>();
        let store = self.cx.breakpoint_store.clone();

        match change {
            StoreChange::Breakpoints(uri) => {
                let breakpoints = store.breakpoints(&uri);
                join_all(sessions.iter().map(|session| {
                    let breakpoints = breakpoints.clone();
                    let uri = &uri;
                    async move { session.set_breakpoints(uri, breakpoints).await.log_err() }
                }))
                .await;
                self.notify_breakpoints_changed([uri]);
            }
            StoreChange::FunctionBreakpoints => {
                join_all(
                    sessions
                        .iter()
                        .map(|session| async move { session.set_function_breakpoints().await.log_err() }),
                )
                .await;
            }
            StoreChange::ExceptionBreakpoints => {
                join_all(
                    sessions
                        .iter()
                        .map(|session| async move { session.set_exception_breakpoints().await.log_err() }),
                )
                .await;
            }
            StoreChange::Activation => {
                let uris = store.uris();
                join_all(sessions.iter().map(|session| {
                    let store = &store;
                    let uris = &uris;
                    async move {
                        for uri in uris {
                            session
                                .set_breakpoints(uri, store.breakpoints(uri))
                                .await
                                .log_err();
                        }
                        session.set_function_breakpoints().await.log_err();
                    }
                }))
                .await;
                self.notify_breakpoints_changed(uris);
            }
        }
        self.schedule_save();
    }
}

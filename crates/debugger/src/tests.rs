use crate::{
    BreakpointStore, DebugConfiguration, DebugRequestKind, DebugSessionOptions, IdentityResolver,
    InMemoryKeyValueStore, SessionContext, SessionManager, SessionManagerEvent,
    TransportSessionFactory,
};
use dap::{debugger_settings::DebuggerSettings, Capabilities, FakeAdapter};
use futures::channel::mpsc::UnboundedReceiver;
use parking_lot::Mutex;
use std::sync::Arc;
use util::ForegroundExecutor;


#[ctor::ctor]
fn init_logger() {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }
}

pub(crate) struct TestManager {
    pub executor: ForegroundExecutor,
    pub manager: Arc<SessionManager>,
    pub kvp: Arc<InMemoryKeyValueStore>,
    /// One fake adapter per session the manager created, in creation order.
    pub adapters: Arc<Mutex<Vec<FakeAdapter>>>,
}

impl TestManager {
    pub fn adapter(&self, ix: usize) -> FakeAdapter {
        self.adapters.lock()[ix].clone()
    }

    pub fn store(&self) -> &Arc<BreakpointStore> {
        self.manager.breakpoint_store()
    }
}

pub(crate) fn settings() -> DebuggerSettings {
    DebuggerSettings {
        notification_delay_ms: 0,
        ..Default::default()
    }
}

/// A manager whose "fake" sessions talk to fake adapters that complete the
/// handshake with `capabilities`.
pub(crate) fn init_test(settings: DebuggerSettings, capabilities: Capabilities) -> TestManager {
    let executor = ForegroundExecutor::new();
    let kvp = Arc::new(InMemoryKeyValueStore::new());
    let manager = SessionManager::new(
        SessionContext {
            breakpoint_store: Arc::new(BreakpointStore::new()),
            settings,
            executor: executor.clone(),
            trace_sink: None,
        },
        Arc::new(IdentityResolver),
        Some(kvp.clone()),
    );

    let adapters = Arc::new(Mutex::new(Vec::new()));
    manager.register_factory(
        "fake",
        Arc::new(TransportSessionFactory::new({
            let adapters = adapters.clone();
            move |_: &DebugConfiguration| {
                let (fake, transport) = FakeAdapter::new();
                fake.handshake(capabilities.clone());
                adapters.lock().push(fake);
                Ok(transport)
            }
        })),
    );

    TestManager {
        executor,
        manager,
        kvp,
        adapters,
    }
}

pub(crate) fn options(name: &str) -> Arc<DebugSessionOptions> {
    Arc::new(
        DebugSessionOptions::new(DebugConfiguration::new(
            name,
            "fake",
            DebugRequestKind::Launch,
        ))
        .with_workspace("/project"),
    )
}

pub(crate) fn drain(events: &mut UnboundedReceiver<SessionManagerEvent>) -> Vec<SessionManagerEvent> {
    let mut drained = Vec::new();
    while let Ok(Some(event)) = events.try_next() {
        drained.push(event);
    }
    drained
}

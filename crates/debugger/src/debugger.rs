pub mod breakpoint_store;
pub mod configuration;
mod debounced_delay;
pub mod persistence;
pub mod session;
pub mod session_manager;

#[cfg(test)]
mod tests;

pub use breakpoint_store::{
    BreakpointId, BreakpointStore, BreakpointsChangeEvent, ExceptionBreakpoint,
    FunctionBreakpoint, SourceBreakpoint, Uri,
};
pub use configuration::{
    ConfigurationResolver, DebugConfiguration, DebugRequestKind, DebugSessionOptions,
    IdentityResolver,
};
pub use persistence::{InMemoryKeyValueStore, KeyValueStore};
pub use session::{
    DebugBreakpoint, RuntimeBreakpointStatus, Session, SessionContext, SessionEvent, SessionState,
};
pub use session_manager::{
    SessionFactory, SessionManager, SessionManagerEvent, TransportSessionFactory,
    WillStartSessionHook,
};

pub mod client;
pub mod debugger_settings;
pub mod events;
#[cfg(any(test, feature = "test-support"))]
pub mod fake_adapter;
pub mod messages;
pub mod requests;
pub mod transport;
pub mod types;

pub use client::{
    CancellationSource, CancellationToken, ClientContext, DebugAdapterClient, RequestError,
    SessionId,
};
pub use events::{EventKind, Events};
pub use transport::{Channel, IoKind, LogTraceSink, TraceSink, Transport, TransportMessage};
pub use types::*;

#[cfg(any(test, feature = "test-support"))]
pub use fake_adapter::{FakeAdapter, FakeReply};

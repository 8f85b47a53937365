use crate::client::SessionId;
use anyhow::Result;
use futures::channel::mpsc::UnboundedReceiver;
use serde_json::Value;
use std::{fmt, sync::Arc};

/// The outbound half of a connection to a debug adapter. Framing and process
/// management live behind this trait.
pub trait Channel: Send + Sync {
    fn send(&self, message: String) -> Result<()>;
    fn close(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Message(String),
    Closed { code: i64, reason: Option<String> },
}

pub struct Transport {
    pub channel: Arc<dyn Channel>,
    pub inbound: UnboundedReceiver<TransportMessage>,
}

impl Transport {
    pub fn new(channel: Arc<dyn Channel>, inbound: UnboundedReceiver<TransportMessage>) -> Self {
        Self { channel, inbound }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoKind {
    Send,
    Recv,
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoKind::Send => write!(f, "-->"),
            IoKind::Recv => write!(f, "<--"),
        }
    }
}

/// Receives a copy of every message exchanged with an adapter.
pub trait TraceSink: Send + Sync {
    fn trace(&self, session_id: SessionId, kind: IoKind, message: &str);
}

/// Mirrors adapter traffic into the `log` facade under the `dap` target.
pub struct LogTraceSink {
    format: bool,
}

impl LogTraceSink {
    pub fn new(format: bool) -> Self {
        Self { format }
    }

    fn render(&self, message: &str) -> String {
        if !self.format {
            return message.to_string();
        }
        serde_json::from_str::<Value>(message)
            .ok()
            .and_then(|value| serde_json::to_string_pretty(&value).ok())
            .unwrap_or_else(|| message.to_string())
    }
}

impl TraceSink for LogTraceSink {
    fn trace(&self, session_id: SessionId, kind: IoKind, message: &str) {
        log::debug!(target: "dap", "[{session_id}] {kind} {}", self.render(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_trace_sink_formatting() {
        let message = r#"{"seq":1,"type":"event","event":"initialized"}"#;
        assert_eq!(LogTraceSink::new(false).render(message), message);

        let pretty = LogTraceSink::new(true).render(message);
        assert!(pretty.contains('\n'));
        assert!(pretty.contains("\"event\": \"initialized\""));

        assert_eq!(LogTraceSink::new(true).render("not json"), "not json");
    }
}

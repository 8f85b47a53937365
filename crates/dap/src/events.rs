use crate::{
    messages,
    types::{Breakpoint, Capabilities, Source, ThreadId},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// The standard events of the protocol. Anything else arrives as
/// [`Events::Custom`].
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum EventKind {
    Initialized,
    Stopped,
    Continued,
    Exited,
    Terminated,
    Thread,
    Output,
    Breakpoint,
    Module,
    LoadedSource,
    Process,
    Capabilities,
    ProgressStart,
    ProgressUpdate,
    ProgressEnd,
    Invalidated,
    Memory,
}

impl EventKind {
    pub const ALL: &'static [EventKind] = &[
        EventKind::Initialized,
        EventKind::Stopped,
        EventKind::Continued,
        EventKind::Exited,
        EventKind::Terminated,
        EventKind::Thread,
        EventKind::Output,
        EventKind::Breakpoint,
        EventKind::Module,
        EventKind::LoadedSource,
        EventKind::Process,
        EventKind::Capabilities,
        EventKind::ProgressStart,
        EventKind::ProgressUpdate,
        EventKind::ProgressEnd,
        EventKind::Invalidated,
        EventKind::Memory,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Initialized => "initialized",
            EventKind::Stopped => "stopped",
            EventKind::Continued => "continued",
            EventKind::Exited => "exited",
            EventKind::Terminated => "terminated",
            EventKind::Thread => "thread",
            EventKind::Output => "output",
            EventKind::Breakpoint => "breakpoint",
            EventKind::Module => "module",
            EventKind::LoadedSource => "loadedSource",
            EventKind::Process => "process",
            EventKind::Capabilities => "capabilities",
            EventKind::ProgressStart => "progressStart",
            EventKind::ProgressUpdate => "progressUpdate",
            EventKind::ProgressEnd => "progressEnd",
            EventKind::Invalidated => "invalidated",
            EventKind::Memory => "memory",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Events {
    Initialized(Option<Capabilities>),
    Stopped(StoppedEvent),
    Continued(ContinuedEvent),
    Exited(ExitedEvent),
    Terminated(Option<TerminatedEvent>),
    Thread(ThreadEvent),
    Output(OutputEvent),
    Breakpoint(BreakpointEvent),
    Capabilities(CapabilitiesEvent),
    Module(Value),
    LoadedSource(Value),
    Process(Value),
    ProgressStart(Value),
    ProgressUpdate(Value),
    ProgressEnd(Value),
    Invalidated(Value),
    Memory(Value),
    Custom(CustomEvent),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CustomEvent {
    pub event: String,
    pub body: Option<Value>,
}

impl Events {
    /// Parses a wire event. A standard event whose body does not match the
    /// protocol shape is logged and delivered as a custom event so that
    /// subscribers still see it, except for `exited` and `terminated`, which
    /// always arrive as themselves.
    pub fn parse(event: messages::Event) -> Self {
        let Some(kind) = EventKind::from_name(&event.event) else {
            return Events::Custom(CustomEvent {
                event: event.event,
                body: event.body,
            });
        };

        match Self::parse_standard(kind, event.body.clone()) {
            Ok(parsed) => parsed,
            Err(error) => {
                log::warn!("malformed {} event body: {error}", event.event);
                match kind {
                    EventKind::Exited => Events::Exited(ExitedEvent::default()),
                    EventKind::Terminated => Events::Terminated(None),
                    _ => Events::Custom(CustomEvent {
                        event: event.event,
                        body: event.body,
                    }),
                }
            }
        }
    }

    fn parse_standard(kind: EventKind, body: Option<Value>) -> serde_json::Result<Self> {
        let raw = || body.clone().unwrap_or(Value::Null);
        Ok(match kind {
            EventKind::Initialized => Events::Initialized(optional_body(body.clone())?),
            EventKind::Stopped => Events::Stopped(optional_body(body.clone())?.unwrap_or_default()),
            EventKind::Continued => Events::Continued(optional_body(body.clone())?.unwrap_or_default()),
            EventKind::Exited => Events::Exited(optional_body(body.clone())?.unwrap_or_default()),
            EventKind::Terminated => Events::Terminated(optional_body(body.clone())?),
            EventKind::Thread => Events::Thread(required_body(body.clone())?),
            EventKind::Output => Events::Output(required_body(body.clone())?),
            EventKind::Breakpoint => Events::Breakpoint(required_body(body.clone())?),
            EventKind::Capabilities => Events::Capabilities(required_body(body.clone())?),
            EventKind::Module => Events::Module(raw()),
            EventKind::LoadedSource => Events::LoadedSource(raw()),
            EventKind::Process => Events::Process(raw()),
            EventKind::ProgressStart => Events::ProgressStart(raw()),
            EventKind::ProgressUpdate => Events::ProgressUpdate(raw()),
            EventKind::ProgressEnd => Events::ProgressEnd(raw()),
            EventKind::Invalidated => Events::Invalidated(raw()),
            EventKind::Memory => Events::Memory(raw()),
        })
    }

    /// `None` for custom events.
    pub fn kind(&self) -> Option<EventKind> {
        Some(match self {
            Events::Initialized(_) => EventKind::Initialized,
            Events::Stopped(_) => EventKind::Stopped,
            Events::Continued(_) => EventKind::Continued,
            Events::Exited(_) => EventKind::Exited,
            Events::Terminated(_) => EventKind::Terminated,
            Events::Thread(_) => EventKind::Thread,
            Events::Output(_) => EventKind::Output,
            Events::Breakpoint(_) => EventKind::Breakpoint,
            Events::Capabilities(_) => EventKind::Capabilities,
            Events::Module(_) => EventKind::Module,
            Events::LoadedSource(_) => EventKind::LoadedSource,
            Events::Process(_) => EventKind::Process,
            Events::ProgressStart(_) => EventKind::ProgressStart,
            Events::ProgressUpdate(_) => EventKind::ProgressUpdate,
            Events::ProgressEnd(_) => EventKind::ProgressEnd,
            Events::Invalidated(_) => EventKind::Invalidated,
            Events::Memory(_) => EventKind::Memory,
            Events::Custom(_) => return None,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Events::Custom(custom) => &custom.event,
            _ => self.kind().map_or("", |kind| kind.name()),
        }
    }
}

fn required_body<T: DeserializeOwned>(body: Option<Value>) -> serde_json::Result<T> {
    serde_json::from_value(body.unwrap_or(Value::Null))
}

fn optional_body<T: DeserializeOwned>(body: Option<Value>) -> serde_json::Result<Option<T>> {
    match body {
        None | Some(Value::Null) => Ok(None),
        Some(body) => serde_json::from_value(body).map(Some),
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEvent {
    #[serde(default)]
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserve_focus_hint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_threads_stopped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_breakpoint_ids: Option<Vec<u64>>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuedEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_threads_continued: Option<bool>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitedEvent {
    #[serde(default)]
    pub exit_code: i64,
    /// Only set on the event synthesized when the channel closes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminatedEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<Value>,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEvent {
    pub reason: String,
    pub thread_id: ThreadId,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables_reference: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointEvent {
    pub reason: String,
    pub breakpoint: Breakpoint,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesEvent {
    pub capabilities: Capabilities,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn event(name: &str, body: Option<Value>) -> messages::Event {
        messages::Event {
            seq: 1,
            event: name.into(),
            body,
        }
    }

    #[test]
    fn test_event_kind_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(*kind));
        }
        assert_eq!(EventKind::from_name("rust-analyzer/custom"), None);
    }

    #[test]
    fn test_parse_standard_events() {
        assert_eq!(
            Events::parse(event(
                "stopped",
                Some(json!({ "reason": "breakpoint", "threadId": 3 }))
            )),
            Events::Stopped(StoppedEvent {
                reason: "breakpoint".into(),
                description: None,
                thread_id: Some(ThreadId(3)),
                preserve_focus_hint: None,
                text: None,
                all_threads_stopped: None,
                hit_breakpoint_ids: None,
            })
        );
        assert_eq!(
            Events::parse(event("terminated", None)),
            Events::Terminated(None)
        );
        assert_eq!(
            Events::parse(event("continued", Some(json!({ "threadId": 1 })))),
            Events::Continued(ContinuedEvent {
                thread_id: Some(ThreadId(1)),
                all_threads_continued: None,
            })
        );
        assert_eq!(
            Events::parse(event("initialized", None)),
            Events::Initialized(None)
        );
    }

    #[test]
    fn test_unknown_and_malformed_events_are_custom() {
        let parsed = Events::parse(event("heartbeat", Some(json!({ "n": 1 }))));
        assert_eq!(parsed.kind(), None);
        assert_eq!(parsed.name(), "heartbeat");

        let parsed = Events::parse(event("stopped", Some(json!({ "threadId": "main" }))));
        assert_eq!(
            parsed,
            Events::Custom(CustomEvent {
                event: "stopped".into(),
                body: Some(json!({ "threadId": "main" })),
            })
        );
    }

    #[test]
    fn test_lifecycle_events_tolerate_missing_fields() {
        assert_eq!(
            Events::parse(event("exited", None)),
            Events::Exited(ExitedEvent::default())
        );
        assert_eq!(
            Events::parse(event("exited", Some(json!({})))),
            Events::Exited(ExitedEvent::default())
        );
        assert_eq!(
            Events::parse(event("exited", Some(json!({ "exitCode": "none" })))),
            Events::Exited(ExitedEvent::default())
        );
        assert_eq!(
            Events::parse(event("terminated", Some(json!("done")))),
            Events::Terminated(None)
        );
        assert_eq!(
            Events::parse(event("stopped", Some(json!({ "threadId": 1 })))),
            Events::Stopped(StoppedEvent {
                thread_id: Some(ThreadId(1)),
                ..Default::default()
            })
        );
    }
}

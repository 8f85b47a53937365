use crate::types::SteppingGranularity;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Which thread becomes current when a `stopped` event names none.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadFallback {
    /// The first thread in the adapter's `threads` response.
    #[default]
    FirstReported,
    /// The thread with the numerically lowest id.
    LowestId,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DebuggerSettings {
    /// Determines the stepping granularity.
    ///
    /// Default: line
    pub stepping_granularity: SteppingGranularity,
    /// Whether the breakpoints should be reused across sessions.
    ///
    /// Default: true
    pub save_breakpoints: bool,
    /// Time in milliseconds to wait for a debug adapter to acknowledge
    /// `terminate` or `disconnect` during teardown.
    ///
    /// Default: 2000ms
    pub timeout: u64,
    /// Whether to log messages between active debug adapters and the client
    ///
    /// Default: true
    pub log_dap_communications: bool,
    /// Whether to format dap messages when adding them to the debug adapter log
    ///
    /// Default: true
    pub format_dap_log_messages: bool,
    /// Which thread to select when an adapter stops without naming a thread.
    ///
    /// Default: first_reported
    pub stopped_thread_fallback: ThreadFallback,
    /// Time in milliseconds to coalesce breakpoint change notifications and
    /// breakpoint saves over. Zero delivers them immediately.
    ///
    /// Default: 25ms
    pub notification_delay_ms: u64,
}

impl Default for DebuggerSettings {
    fn default() -> Self {
        Self {
            save_breakpoints: true,
            stepping_granularity: SteppingGranularity::Line,
            timeout: 2000,
            log_dap_communications: true,
            format_dap_log_messages: true,
            stopped_thread_fallback: ThreadFallback::FirstReported,
            notification_delay_ms: 25,
        }
    }
}

impl DebuggerSettings {
    pub const KEY: &'static str = "debugger";

    /// Reads settings from a JSON document. Missing fields take their default
    /// value; a document that cannot be parsed yields the defaults.
    pub fn from_json(content: &str) -> Self {
        if content.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str(content) {
            Ok(settings) => settings,
            Err(error) => {
                log::warn!("invalid {} settings, using defaults: {error}", Self::KEY);
                Self::default()
            }
        }
    }

    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(DebuggerSettings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_settings_keep_defaults() {
        let settings = DebuggerSettings::from_json(
            r#"{ "save_breakpoints": false, "stopped_thread_fallback": "lowest_id" }"#,
        );
        assert_eq!(
            settings,
            DebuggerSettings {
                save_breakpoints: false,
                stopped_thread_fallback: ThreadFallback::LowestId,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_malformed_settings_fall_back_to_defaults() {
        assert_eq!(
            DebuggerSettings::from_json("{ not json"),
            DebuggerSettings::default()
        );
        assert_eq!(DebuggerSettings::from_json(""), DebuggerSettings::default());
    }

    #[test]
    fn test_schema_lists_every_setting() {
        let schema = serde_json::to_value(DebuggerSettings::json_schema()).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        for key in [
            "stepping_granularity",
            "save_breakpoints",
            "timeout",
            "log_dap_communications",
            "format_dap_log_messages",
            "stopped_thread_fallback",
            "notification_delay_ms",
        ] {
            assert!(properties.contains_key(key), "missing {key}");
        }
    }
}

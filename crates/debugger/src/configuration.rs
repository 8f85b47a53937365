use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DebugRequestKind {
    Launch,
    Attach,
}

/// A launch configuration as written by the user. Everything besides the
/// common fields is adapter specific and passed through untouched.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DebugConfiguration {
    pub name: String,
    #[serde(rename = "type")]
    pub adapter: String,
    pub request: DebugRequestKind,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DebugConfiguration {
    pub fn new(name: impl Into<String>, adapter: impl Into<String>, request: DebugRequestKind) -> Self {
        Self {
            name: name.into(),
            adapter: adapter.into(),
            request,
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// The arguments of the `launch` or `attach` request for this
    /// configuration. `restart` is the opaque payload of a previous
    /// `terminated` event, passed back as `__restart`.
    pub fn request_arguments(&self, no_debug: bool, restart: Option<Value>) -> Value {
        let mut arguments = serde_json::to_value(self)
            .ok()
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();
        if no_debug {
            arguments.insert("noDebug".into(), Value::Bool(true));
        }
        if let Some(restart) = restart {
            arguments.insert("__restart".into(), restart);
        }
        Value::Object(arguments)
    }
}

/// Everything needed to (re)start a session. Held behind an `Arc` so that a
/// restarted session reuses the same options object, and with it the same
/// disambiguation id.
#[derive(Debug)]
pub struct DebugSessionOptions {
    pub configuration: DebugConfiguration,
    pub workspace: Option<String>,
    pub no_debug: bool,
    disambiguation_id: OnceLock<u32>,
}

impl DebugSessionOptions {
    pub fn new(configuration: DebugConfiguration) -> Self {
        Self {
            configuration,
            workspace: None,
            no_debug: false,
            disambiguation_id: OnceLock::new(),
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_no_debug(mut self, no_debug: bool) -> Self {
        self.no_debug = no_debug;
        self
    }

    pub fn with_disambiguation_id(self, id: u32) -> Self {
        self.disambiguation_id.set(id).ok();
        self
    }

    pub fn disambiguation_id(&self) -> Option<u32> {
        self.disambiguation_id.get().copied()
    }

    pub(crate) fn get_or_init_disambiguation_id(&self, f: impl FnOnce() -> u32) -> u32 {
        *self.disambiguation_id.get_or_init(f)
    }
}

/// Turns a raw configuration into the one a session is launched with, for
/// example by substituting variables. Returning `None` cancels the start.
#[async_trait(?Send)]
pub trait ConfigurationResolver {
    async fn resolve(
        &self,
        configuration: DebugConfiguration,
        workspace: Option<&str>,
    ) -> Result<Option<DebugConfiguration>>;
}

pub struct IdentityResolver;

#[async_trait(?Send)]
impl ConfigurationResolver for IdentityResolver {
    async fn resolve(
        &self,
        configuration: DebugConfiguration,
        _: Option<&str>,
    ) -> Result<Option<DebugConfiguration>> {
        Ok(Some(configuration))
    }
}

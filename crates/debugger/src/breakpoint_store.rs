use crate::persistence::KeyValueStore;
use anyhow::{Context as _, Result};
use dap::ExceptionBreakpointsFilter;
use futures::channel::mpsc::UnboundedReceiver;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, BTreeSet},
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};
use util::EventEmitter;

pub const BREAKPOINTS_KEY: &str = "debugger/breakpoints";

/// A document identifier, usually a `file://` URI or a plain path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Uri(Arc<str>);

impl Uri {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path the adapter knows this document by.
    pub fn path(&self) -> &str {
        self.0.strip_prefix("file://").unwrap_or(&self.0)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path()
            .rsplit(['/', '\\'])
            .next()
            .filter(|name| !name.is_empty())
    }
}

impl From<&str> for Uri {
    fn from(uri: &str) -> Self {
        Self(uri.into())
    }
}

impl From<String> for Uri {
    fn from(uri: String) -> Self {
        Self(uri.into())
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u64);

impl BreakpointId {
    pub fn new(uri: &Uri, line: u32, column: Option<u32>) -> Self {
        let mut hasher = DefaultHasher::new();
        (uri, line, column).hash(&mut hasher);
        Self(hasher.finish())
    }
}

fn enabled_by_default() -> bool {
    true
}

/// A breakpoint the user placed in a document. Its identity is its position;
/// everything else can change in place.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    pub uri: Uri,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl SourceBreakpoint {
    pub fn new(uri: impl Into<Uri>, line: u32) -> Self {
        Self {
            uri: uri.into(),
            line,
            column: None,
            condition: None,
            hit_condition: None,
            log_message: None,
            enabled: true,
        }
    }

    pub fn with_column(mut self, column: u32) -> Self {
        self.column = Some(column);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_log_message(mut self, log_message: impl Into<String>) -> Self {
        self.log_message = Some(log_message.into());
        self
    }

    pub fn id(&self) -> BreakpointId {
        BreakpointId::new(&self.uri, self.line, self.column)
    }

    fn position(&self) -> (u32, Option<u32>) {
        (self.line, self.column)
    }

    pub fn to_protocol(&self) -> dap::SourceBreakpoint {
        dap::SourceBreakpoint {
            line: self.line,
            column: self.column,
            condition: self.condition.clone(),
            hit_condition: self.hit_condition.clone(),
            log_message: self.log_message.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionBreakpoint {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl FunctionBreakpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: None,
            hit_condition: None,
            enabled: true,
        }
    }

    pub fn to_protocol(&self) -> dap::FunctionBreakpoint {
        dap::FunctionBreakpoint {
            name: self.name.clone(),
            condition: self.condition.clone(),
            hit_condition: self.hit_condition.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionBreakpoint {
    pub filter: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub default: bool,
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BreakpointsChangeEvent {
    pub uri: Uri,
    pub added: Vec<SourceBreakpoint>,
    pub removed: Vec<SourceBreakpoint>,
    pub changed: Vec<SourceBreakpoint>,
}

impl Default for Uri {
    fn default() -> Self {
        Self("".into())
    }
}

impl BreakpointsChangeEvent {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
struct SerializedBreakpoints {
    activated: bool,
    breakpoints: BTreeMap<Uri, Vec<SourceBreakpoint>>,
    exception_breakpoints: Vec<ExceptionBreakpoint>,
    function_breakpoints: Vec<FunctionBreakpoint>,
}

impl Default for SerializedBreakpoints {
    fn default() -> Self {
        Self {
            activated: true,
            breakpoints: Default::default(),
            exception_breakpoints: Default::default(),
            function_breakpoints: Default::default(),
        }
    }
}

struct BreakpointStoreState {
    activated: bool,
    breakpoints: BTreeMap<Uri, Vec<SourceBreakpoint>>,
    exception_breakpoints: IndexMap<String, ExceptionBreakpoint>,
    function_breakpoints: Vec<FunctionBreakpoint>,
}

/// The single source of truth for user breakpoints. Every mutation goes
/// through here and is reported on the matching change stream.
pub struct BreakpointStore {
    state: Mutex<BreakpointStoreState>,
    breakpoints_changed: EventEmitter<BreakpointsChangeEvent>,
    function_breakpoints_changed: EventEmitter<()>,
    exception_breakpoints_changed: EventEmitter<()>,
    activation_changed: EventEmitter<bool>,
}

impl Default for BreakpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BreakpointStoreState {
                activated: true,
                breakpoints: BTreeMap::new(),
                exception_breakpoints: IndexMap::new(),
                function_breakpoints: Vec::new(),
            }),
            breakpoints_changed: EventEmitter::new(),
            function_breakpoints_changed: EventEmitter::new(),
            exception_breakpoints_changed: EventEmitter::new(),
            activation_changed: EventEmitter::new(),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<BreakpointsChangeEvent> {
        self.breakpoints_changed.subscribe()
    }

    pub fn subscribe_function_breakpoints(&self) -> UnboundedReceiver<()> {
        self.function_breakpoints_changed.subscribe()
    }

    pub fn subscribe_exception_breakpoints(&self) -> UnboundedReceiver<()> {
        self.exception_breakpoints_changed.subscribe()
    }

    pub fn subscribe_activation(&self) -> UnboundedReceiver<bool> {
        self.activation_changed.subscribe()
    }

    pub fn breakpoints(&self, uri: &Uri) -> Vec<SourceBreakpoint> {
        self.state
            .lock()
            .breakpoints
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_breakpoints(&self) -> BTreeMap<Uri, Vec<SourceBreakpoint>> {
        self.state.lock().breakpoints.clone()
    }

    pub fn uris(&self) -> Vec<Uri> {
        self.state.lock().breakpoints.keys().cloned().collect()
    }

    pub fn breakpoint(&self, uri: &Uri, id: BreakpointId) -> Option<SourceBreakpoint> {
        self.state
            .lock()
            .breakpoints
            .get(uri)?
            .iter()
            .find(|breakpoint| breakpoint.id() == id)
            .cloned()
    }

    /// Replaces every breakpoint of `uri` and reports the difference as a
    /// single event.
    pub fn set_breakpoints(
        &self,
        uri: &Uri,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> BreakpointsChangeEvent {
        let event = {
            let mut state = self.state.lock();
            let previous = state.breakpoints.remove(uri).unwrap_or_default();

            let mut next = IndexMap::<BreakpointId, SourceBreakpoint>::new();
            for mut breakpoint in breakpoints {
                breakpoint.uri = uri.clone();
                next.insert(breakpoint.id(), breakpoint);
            }
            let mut next = next.into_values().collect::<Vec<_>>();
            next.sort_by_key(SourceBreakpoint::position);

            let event = diff_breakpoints(uri, &previous, &next);
            if !next.is_empty() {
                state.breakpoints.insert(uri.clone(), next);
            }
            event
        };

        log::debug!(
            "breakpoints of {uri} changed: {} added, {} removed, {} changed",
            event.added.len(),
            event.removed.len(),
            event.changed.len()
        );
        self.breakpoints_changed.emit(event.clone());
        event
    }

    /// Adds `breakpoint` unless one already exists at the same position.
    /// Returns whether anything was added.
    pub fn add_breakpoint(&self, breakpoint: SourceBreakpoint) -> bool {
        let mut breakpoints = self.breakpoints(&breakpoint.uri);
        if breakpoints
            .iter()
            .any(|existing| existing.position() == breakpoint.position())
        {
            return false;
        }
        let uri = breakpoint.uri.clone();
        breakpoints.push(breakpoint);
        self.set_breakpoints(&uri, breakpoints);
        true
    }

    pub fn remove_breakpoint(
        &self,
        uri: &Uri,
        line: u32,
        column: Option<u32>,
    ) -> Option<SourceBreakpoint> {
        let mut breakpoints = self.breakpoints(uri);
        let ix = breakpoints
            .iter()
            .position(|existing| existing.position() == (line, column))?;
        let removed = breakpoints.remove(ix);
        self.set_breakpoints(uri, breakpoints);
        Some(removed)
    }

    /// Adds a breakpoint at the position, or removes the one already there.
    pub fn toggle_breakpoint(&self, breakpoint: SourceBreakpoint) {
        let uri = breakpoint.uri.clone();
        if self
            .remove_breakpoint(&uri, breakpoint.line, breakpoint.column)
            .is_none()
        {
            self.add_breakpoint(breakpoint);
        }
    }

    /// Replaces the fields of the existing breakpoint with the same identity.
    pub fn update_breakpoint(&self, breakpoint: SourceBreakpoint) -> bool {
        let mut breakpoints = self.breakpoints(&breakpoint.uri);
        let Some(existing) = breakpoints
            .iter_mut()
            .find(|existing| existing.id() == breakpoint.id())
        else {
            return false;
        };
        if *existing == breakpoint {
            return true;
        }
        let uri = breakpoint.uri.clone();
        *existing = breakpoint;
        self.set_breakpoints(&uri, breakpoints);
        true
    }

    pub fn clear_breakpoints(&self, uri: &Uri) {
        if self.state.lock().breakpoints.contains_key(uri) {
            self.set_breakpoints(uri, Vec::new());
        }
    }

    pub fn clear_all_breakpoints(&self) {
        for uri in self.uris() {
            self.set_breakpoints(&uri, Vec::new());
        }
    }

    /// Enables or disables every breakpoint. Only documents whose breakpoints
    /// actually change are reported.
    pub fn enable_all_breakpoints(&self, enabled: bool) {
        for (uri, breakpoints) in self.all_breakpoints() {
            if breakpoints
                .iter()
                .all(|breakpoint| breakpoint.enabled == enabled)
            {
                continue;
            }
            let breakpoints = breakpoints
                .into_iter()
                .map(|breakpoint| SourceBreakpoint {
                    enabled,
                    ..breakpoint
                })
                .collect();
            self.set_breakpoints(&uri, breakpoints);
        }
    }

    pub fn breakpoints_activated(&self) -> bool {
        self.state.lock().activated
    }

    /// The global switch: while deactivated, sessions receive no source
    /// breakpoints at all.
    pub fn set_breakpoints_activated(&self, activated: bool) {
        {
            let mut state = self.state.lock();
            if state.activated == activated {
                return;
            }
            state.activated = activated;
        }
        self.activation_changed.emit(activated);
    }

    pub fn function_breakpoints(&self) -> Vec<FunctionBreakpoint> {
        self.state.lock().function_breakpoints.clone()
    }

    pub fn set_function_breakpoints(&self, breakpoints: Vec<FunctionBreakpoint>) {
        let mut unique = IndexMap::<String, FunctionBreakpoint>::new();
        for breakpoint in breakpoints {
            unique.insert(breakpoint.name.clone(), breakpoint);
        }
        let breakpoints = unique.into_values().collect::<Vec<_>>();
        {
            let mut state = self.state.lock();
            if state.function_breakpoints == breakpoints {
                return;
            }
            state.function_breakpoints = breakpoints;
        }
        self.function_breakpoints_changed.emit(());
    }

    pub fn add_function_breakpoint(&self, breakpoint: FunctionBreakpoint) {
        let mut breakpoints = self.function_breakpoints();
        breakpoints.retain(|existing| existing.name != breakpoint.name);
        breakpoints.push(breakpoint);
        self.set_function_breakpoints(breakpoints);
    }

    pub fn remove_function_breakpoint(&self, name: &str) {
        let mut breakpoints = self.function_breakpoints();
        breakpoints.retain(|existing| existing.name != name);
        self.set_function_breakpoints(breakpoints);
    }

    pub fn exception_breakpoints(&self) -> Vec<ExceptionBreakpoint> {
        self.state
            .lock()
            .exception_breakpoints
            .values()
            .cloned()
            .collect()
    }

    pub fn enabled_exception_filters(&self) -> Vec<String> {
        self.state
            .lock()
            .exception_breakpoints
            .values()
            .filter(|breakpoint| breakpoint.enabled)
            .map(|breakpoint| breakpoint.filter.clone())
            .collect()
    }

    /// Seeds exception filters from an adapter's capabilities. Filters the
    /// user already chose keep their enabled state; new ones start at the
    /// adapter's default.
    pub fn set_exception_filters(&self, filters: &[ExceptionBreakpointsFilter]) {
        let changed = {
            let mut state = self.state.lock();
            let mut changed = false;
            for filter in filters {
                let enabled = state
                    .exception_breakpoints
                    .get(&filter.filter)
                    .map_or(filter.default.unwrap_or(false), |existing| existing.enabled);
                let breakpoint = ExceptionBreakpoint {
                    filter: filter.filter.clone(),
                    label: filter.label.clone(),
                    description: filter.description.clone(),
                    default: filter.default.unwrap_or(false),
                    enabled,
                };
                if state.exception_breakpoints.get(&filter.filter) != Some(&breakpoint) {
                    state
                        .exception_breakpoints
                        .insert(filter.filter.clone(), breakpoint);
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.exception_breakpoints_changed.emit(());
        }
    }

    pub fn set_exception_breakpoint_enabled(&self, filter: &str, enabled: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            let breakpoint = state
                .exception_breakpoints
                .get_mut(filter)
                .with_context(|| format!("unknown exception filter {filter}"))?;
            if breakpoint.enabled == enabled {
                return Ok(());
            }
            breakpoint.enabled = enabled;
        }
        self.exception_breakpoints_changed.emit(());
        Ok(())
    }

    /// Replaces the store's contents with the persisted record. Records that
    /// are missing or cannot be parsed load as an empty store.
    pub async fn load(&self, kvp: &dyn KeyValueStore) -> Result<()> {
        let content = kvp
            .read_kvp(BREAKPOINTS_KEY)
            .await
            .context("reading persisted breakpoints")?;
        let serialized = match content.as_deref().map(str::trim) {
            None | Some("") => SerializedBreakpoints::default(),
            Some(content) => serde_json::from_str(content).unwrap_or_else(|error| {
                log::warn!("discarding malformed persisted breakpoints: {error}");
                SerializedBreakpoints::default()
            }),
        };

        let uris = self
            .uris()
            .into_iter()
            .chain(serialized.breakpoints.keys().cloned())
            .collect::<BTreeSet<_>>();
        for uri in uris {
            let breakpoints = serialized.breakpoints.get(&uri).cloned().unwrap_or_default();
            self.set_breakpoints(&uri, breakpoints);
        }

        let exception_breakpoints_changed = {
            let mut state = self.state.lock();
            let exception_breakpoints = serialized
                .exception_breakpoints
                .into_iter()
                .map(|breakpoint| (breakpoint.filter.clone(), breakpoint))
                .collect::<IndexMap<_, _>>();
            let changed = state.exception_breakpoints != exception_breakpoints;
            state.exception_breakpoints = exception_breakpoints;
            changed
        };
        if exception_breakpoints_changed {
            self.exception_breakpoints_changed.emit(());
        }

        self.set_function_breakpoints(serialized.function_breakpoints);
        self.set_breakpoints_activated(serialized.activated);
        Ok(())
    }

    pub async fn save(&self, kvp: &dyn KeyValueStore) -> Result<()> {
        let serialized = {
            let state = self.state.lock();
            SerializedBreakpoints {
                activated: state.activated,
                breakpoints: state.breakpoints.clone(),
                exception_breakpoints: state.exception_breakpoints.values().cloned().collect(),
                function_breakpoints: state.function_breakpoints.clone(),
            }
        };
        let content = serde_json::to_string(&serialized)?;
        kvp.write_kvp(BREAKPOINTS_KEY.to_string(), content)
            .await
            .context("persisting breakpoints")
    }
}

fn diff_breakpoints(
    uri: &Uri,
    previous: &[SourceBreakpoint],
    next: &[SourceBreakpoint],
) -> BreakpointsChangeEvent {
    let previous_by_id = previous
        .iter()
        .map(|breakpoint| (breakpoint.id(), breakpoint))
        .collect::<IndexMap<_, _>>();
    let next_by_id = next
        .iter()
        .map(|breakpoint| (breakpoint.id(), breakpoint))
        .collect::<IndexMap<_, _>>();

    let mut event = BreakpointsChangeEvent {
        uri: uri.clone(),
        ..Default::default()
    };
    for (id, breakpoint) in &next_by_id {
        match previous_by_id.get(id) {
            None => event.added.push((*breakpoint).clone()),
            Some(old) if old != breakpoint => event.changed.push((*breakpoint).clone()),
            Some(_) => {}
        }
    }
    for (id, breakpoint) in &previous_by_id {
        if !next_by_id.contains_key(id) {
            event.removed.push((*breakpoint).clone());
        }
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryKeyValueStore;
    use futures::StreamExt as _;
    use pretty_assertions::assert_eq;

    fn lines(breakpoints: &[SourceBreakpoint]) -> Vec<u32> {
        breakpoints.iter().map(|breakpoint| breakpoint.line).collect()
    }

    fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = rx.try_next() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_unchanged_breakpoints_are_not_reported_as_changed() {
        let store = BreakpointStore::new();
        let uri = Uri::from("file:///src/main.rs");
        store.set_breakpoints(
            &uri,
            vec![SourceBreakpoint::new(uri.clone(), 5), SourceBreakpoint::new(uri.clone(), 10)],
        );
        let mut changes = store.subscribe();

        let event = store.set_breakpoints(
            &uri,
            vec![SourceBreakpoint::new(uri.clone(), 10), SourceBreakpoint::new(uri.clone(), 20)],
        );
        assert_eq!(lines(&event.added), vec![20]);
        assert_eq!(lines(&event.removed), vec![5]);
        assert!(event.changed.is_empty());
        assert_eq!(drain(&mut changes), vec![event]);
    }

    #[test]
    fn test_set_breakpoints_reports_a_single_diff() {
        let store = BreakpointStore::new();
        let uri = Uri::from("file:///src/main.rs");
        let mut changes = store.subscribe();

        store.set_breakpoints(
            &uri,
            vec![SourceBreakpoint::new(uri.clone(), 10), SourceBreakpoint::new(uri.clone(), 5)],
        );
        store.set_breakpoints(
            &uri,
            vec![
                SourceBreakpoint::new(uri.clone(), 10).with_condition("x > 1"),
                SourceBreakpoint::new(uri.clone(), 20),
            ],
        );

        let events = drain(&mut changes);
        assert_eq!(events.len(), 2);
        assert_eq!(lines(&events[0].added), vec![5, 10]);

        let event = &events[1];
        assert_eq!(event.uri, uri);
        assert_eq!(lines(&event.added), vec![20]);
        assert_eq!(lines(&event.removed), vec![5]);
        assert_eq!(lines(&event.changed), vec![10]);
        assert_eq!(event.changed[0].condition.as_deref(), Some("x > 1"));
        assert_eq!(lines(&store.breakpoints(&uri)), vec![10, 20]);
    }

    #[test]
    fn test_breakpoints_are_sorted_by_line_then_column() {
        let store = BreakpointStore::new();
        let uri = Uri::from("/src/lib.rs");
        store.set_breakpoints(
            &uri,
            vec![
                SourceBreakpoint::new(uri.clone(), 7).with_column(9),
                SourceBreakpoint::new(uri.clone(), 3),
                SourceBreakpoint::new(uri.clone(), 7).with_column(2),
                SourceBreakpoint::new(uri.clone(), 7),
            ],
        );
        let positions = store
            .breakpoints(&uri)
            .iter()
            .map(SourceBreakpoint::position)
            .collect::<Vec<_>>();
        assert_eq!(
            positions,
            vec![(3, None), (7, None), (7, Some(2)), (7, Some(9))]
        );
    }

    #[test]
    fn test_add_remove_and_update() {
        let store = BreakpointStore::new();
        let uri = Uri::from("/src/lib.rs");
        let mut changes = store.subscribe();

        assert!(store.add_breakpoint(SourceBreakpoint::new(uri.clone(), 4)));
        assert!(!store.add_breakpoint(SourceBreakpoint::new(uri.clone(), 4).with_condition("a")));
        assert!(store.update_breakpoint(
            SourceBreakpoint::new(uri.clone(), 4).with_log_message("hit {a}")
        ));
        assert!(!store.update_breakpoint(SourceBreakpoint::new(uri.clone(), 5)));
        assert_eq!(store.remove_breakpoint(&uri, 4, None).map(|bp| bp.line), Some(4));
        assert_eq!(store.remove_breakpoint(&uri, 4, None), None);

        let events = drain(&mut changes);
        assert_eq!(events.len(), 3);
        assert_eq!(lines(&events[0].added), vec![4]);
        assert_eq!(
            events[1].changed[0].log_message.as_deref(),
            Some("hit {a}")
        );
        assert_eq!(lines(&events[2].removed), vec![4]);
        assert!(store.uris().is_empty());
    }

    #[test]
    fn test_disabling_twice_is_idempotent() {
        let store = BreakpointStore::new();
        let first = Uri::from("/a.rs");
        let second = Uri::from("/b.rs");
        store.set_breakpoints(&first, vec![SourceBreakpoint::new(first.clone(), 1)]);
        store.set_breakpoints(
            &second,
            vec![SourceBreakpoint {
                enabled: false,
                ..SourceBreakpoint::new(second.clone(), 2)
            }],
        );
        let mut changes = store.subscribe();

        store.enable_all_breakpoints(false);
        let events = drain(&mut changes);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].uri, first);
        assert_eq!(events[0].changed.len(), 1);

        store.enable_all_breakpoints(false);
        assert!(drain(&mut changes).is_empty());
    }

    #[test]
    fn test_exception_filters_keep_user_choices() {
        let store = BreakpointStore::new();
        let mut changes = store.subscribe_exception_breakpoints();
        let filters = vec![
            ExceptionBreakpointsFilter {
                filter: "panic".into(),
                label: "Rust Panics".into(),
                default: Some(true),
                ..Default::default()
            },
            ExceptionBreakpointsFilter {
                filter: "cpp_throw".into(),
                label: "C++ Throw".into(),
                ..Default::default()
            },
        ];

        store.set_exception_filters(&filters);
        assert_eq!(store.enabled_exception_filters(), vec!["panic".to_string()]);

        store.set_exception_breakpoint_enabled("panic", false).unwrap();
        store.set_exception_breakpoint_enabled("cpp_throw", true).unwrap();
        assert!(store.set_exception_breakpoint_enabled("other", true).is_err());

        store.set_exception_filters(&filters);
        assert_eq!(
            store.enabled_exception_filters(),
            vec!["cpp_throw".to_string()]
        );
        assert_eq!(drain(&mut changes).len(), 3);
    }

    #[test]
    fn test_persistence_round_trip() {
        let kvp = InMemoryKeyValueStore::new();
        let uri = Uri::from("file:///src/main.rs");
        let store = BreakpointStore::new();
        store.set_breakpoints(
            &uri,
            vec![SourceBreakpoint::new(uri.clone(), 3).with_condition("i == 2")],
        );
        store.set_function_breakpoints(vec![FunctionBreakpoint::new("main")]);
        store.set_breakpoints_activated(false);
        smol::block_on(store.save(&kvp)).unwrap();

        let restored = BreakpointStore::new();
        let mut activation = restored.subscribe_activation();
        smol::block_on(restored.load(&kvp)).unwrap();
        assert_eq!(restored.all_breakpoints(), store.all_breakpoints());
        assert_eq!(
            restored.function_breakpoints(),
            vec![FunctionBreakpoint::new("main")]
        );
        assert!(!restored.breakpoints_activated());
        assert_eq!(smol::block_on(activation.next()), Some(false));
    }

    #[test]
    fn test_malformed_persisted_state_loads_empty() {
        let kvp = InMemoryKeyValueStore::new();
        smol::block_on(kvp.write_kvp(BREAKPOINTS_KEY.into(), "{\"breakpoints\": 7".into()))
            .unwrap();

        let store = BreakpointStore::new();
        let uri = Uri::from("/stale.rs");
        store.add_breakpoint(SourceBreakpoint::new(uri.clone(), 1));
        smol::block_on(store.load(&kvp)).unwrap();

        assert!(store.all_breakpoints().is_empty());
        assert!(store.breakpoints_activated());
        assert!(store.function_breakpoints().is_empty());

        let empty = InMemoryKeyValueStore::new();
        smol::block_on(store.load(&empty)).unwrap();
        assert!(store.all_breakpoints().is_empty());
    }
}

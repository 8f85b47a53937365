use crate::types::{
    Breakpoint, Capabilities, FunctionBreakpoint, Scope, Source, SourceBreakpoint, StackFrame,
    SteppingGranularity, Thread, ThreadId, Variable,
};
use ::serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;

/// A request of the debug adapter protocol, in either direction.
pub trait Request {
    type Arguments: DeserializeOwned + Serialize;
    type Response: DeserializeOwned + Serialize;
    const COMMAND: &'static str;
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeArguments {
    #[serde(rename = "clientID", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(rename = "adapterID")]
    pub adapter_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(rename = "linesStartAt1", skip_serializing_if = "Option::is_none")]
    pub lines_start_at_one: Option<bool>,
    #[serde(rename = "columnsStartAt1", skip_serializing_if = "Option::is_none")]
    pub columns_start_at_one: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_variable_type: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_variable_paging: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_run_in_terminal_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_memory_references: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_progress_reporting: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_invalidated_event: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_start_debugging_request: Option<bool>,
}

#[derive(Debug)]
pub enum Initialize {}

impl Request for Initialize {
    type Arguments = InitializeArguments;
    type Response = Capabilities;
    const COMMAND: &'static str = "initialize";
}

/// Launch and attach arguments are adapter specific, so they travel as the
/// raw configuration object.
#[derive(Debug)]
pub enum Launch {}

impl Request for Launch {
    type Arguments = Value;
    type Response = ();
    const COMMAND: &'static str = "launch";
}

#[derive(Debug)]
pub enum Attach {}

impl Request for Attach {
    type Arguments = Value;
    type Response = ();
    const COMMAND: &'static str = "attach";
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartArguments {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug)]
pub enum Restart {}

impl Request for Restart {
    type Arguments = RestartArguments;
    type Response = ();
    const COMMAND: &'static str = "restart";
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectArguments {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminate_debuggee: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend_debuggee: Option<bool>,
}

#[derive(Debug)]
pub enum Disconnect {}

impl Request for Disconnect {
    type Arguments = DisconnectArguments;
    type Response = ();
    const COMMAND: &'static str = "disconnect";
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateArguments {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<bool>,
}

#[derive(Debug)]
pub enum Terminate {}

impl Request for Terminate {
    type Arguments = TerminateArguments;
    type Response = ();
    const COMMAND: &'static str = "terminate";
}

#[derive(Debug)]
pub enum ConfigurationDone {}

impl Request for ConfigurationDone {
    type Arguments = ();
    type Response = ();
    const COMMAND: &'static str = "configurationDone";
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsArguments {
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakpoints: Option<Vec<SourceBreakpoint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_modified: Option<bool>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsResponse {
    #[serde(default)]
    pub breakpoints: Vec<Breakpoint>,
}

#[derive(Debug)]
pub enum SetBreakpoints {}

impl Request for SetBreakpoints {
    type Arguments = SetBreakpointsArguments;
    type Response = SetBreakpointsResponse;
    const COMMAND: &'static str = "setBreakpoints";
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetFunctionBreakpointsArguments {
    pub breakpoints: Vec<FunctionBreakpoint>,
}

#[derive(Debug)]
pub enum SetFunctionBreakpoints {}

impl Request for SetFunctionBreakpoints {
    type Arguments = SetFunctionBreakpointsArguments;
    type Response = SetBreakpointsResponse;
    const COMMAND: &'static str = "setFunctionBreakpoints";
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetExceptionBreakpointsArguments {
    pub filters: Vec<String>,
}

#[derive(Debug)]
pub enum SetExceptionBreakpoints {}

impl Request for SetExceptionBreakpoints {
    type Arguments = SetExceptionBreakpointsArguments;
    type Response = Option<SetBreakpointsResponse>;
    const COMMAND: &'static str = "setExceptionBreakpoints";
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueArguments {
    pub thread_id: ThreadId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_thread: Option<bool>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_threads_continued: Option<bool>,
}

/// Older adapters answer `continue` without a body.
#[derive(Debug)]
pub enum Continue {}

impl Request for Continue {
    type Arguments = ContinueArguments;
    type Response = Option<ContinueResponse>;
    const COMMAND: &'static str = "continue";
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepArguments {
    pub thread_id: ThreadId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_thread: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<SteppingGranularity>,
}

#[derive(Debug)]
pub enum Next {}

impl Request for Next {
    type Arguments = StepArguments;
    type Response = ();
    const COMMAND: &'static str = "next";
}

#[derive(Debug)]
pub enum StepIn {}

impl Request for StepIn {
    type Arguments = StepArguments;
    type Response = ();
    const COMMAND: &'static str = "stepIn";
}

#[derive(Debug)]
pub enum StepOut {}

impl Request for StepOut {
    type Arguments = StepArguments;
    type Response = ();
    const COMMAND: &'static str = "stepOut";
}

#[derive(Debug)]
pub enum StepBack {}

impl Request for StepBack {
    type Arguments = StepArguments;
    type Response = ();
    const COMMAND: &'static str = "stepBack";
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseArguments {
    pub thread_id: ThreadId,
}

#[derive(Debug)]
pub enum Pause {}

impl Request for Pause {
    type Arguments = PauseArguments;
    type Response = ();
    const COMMAND: &'static str = "pause";
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadsResponse {
    #[serde(default)]
    pub threads: Vec<Thread>,
}

#[derive(Debug)]
pub enum Threads {}

impl Request for Threads {
    type Arguments = ();
    type Response = ThreadsResponse;
    const COMMAND: &'static str = "threads";
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceArguments {
    pub thread_id: ThreadId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_frame: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub levels: Option<u64>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<u64>,
    #[serde(default)]
    pub stack_frames: Vec<StackFrame>,
}

#[derive(Debug)]
pub enum StackTrace {}

impl Request for StackTrace {
    type Arguments = StackTraceArguments;
    type Response = StackTraceResponse;
    const COMMAND: &'static str = "stackTrace";
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesArguments {
    pub frame_id: u64,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesResponse {
    #[serde(default)]
    pub scopes: Vec<Scope>,
}

#[derive(Debug)]
pub enum Scopes {}

impl Request for Scopes {
    type Arguments = ScopesArguments;
    type Response = ScopesResponse;
    const COMMAND: &'static str = "scopes";
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesArguments {
    pub variables_reference: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesResponse {
    #[serde(default)]
    pub variables: Vec<Variable>,
}

#[derive(Debug)]
pub enum Variables {}

impl Request for Variables {
    type Arguments = VariablesArguments;
    type Response = VariablesResponse;
    const COMMAND: &'static str = "variables";
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArguments {
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    pub result: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub ty: Option<String>,
    #[serde(default)]
    pub variables_reference: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub named_variables: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_variables: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_reference: Option<String>,
}

#[derive(Debug)]
pub enum Evaluate {}

impl Request for Evaluate {
    type Arguments = EvaluateArguments;
    type Response = EvaluateResponse;
    const COMMAND: &'static str = "evaluate";
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelArguments {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_id: Option<String>,
}

#[derive(Debug)]
pub enum Cancel {}

impl Request for Cancel {
    type Arguments = CancelArguments;
    type Response = ();
    const COMMAND: &'static str = "cancel";
}

// Reverse Requests

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInTerminalResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell_process_id: Option<u32>,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInTerminalArguments {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub cwd: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, Option<String>>>,
}

#[derive(Debug)]
pub enum RunInTerminal {}

impl Request for RunInTerminal {
    type Arguments = RunInTerminalArguments;
    type Response = RunInTerminalResponse;
    const COMMAND: &'static str = "runInTerminal";
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDebuggingArguments {
    pub configuration: Value,
    pub request: String,
}

#[derive(Debug)]
pub enum StartDebugging {}

impl Request for StartDebugging {
    type Arguments = StartDebuggingArguments;
    type Response = ();
    const COMMAND: &'static str = "startDebugging";
}

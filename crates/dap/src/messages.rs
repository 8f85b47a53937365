use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single frame on the wire, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub seq: u64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Response {
    #[serde(default)]
    pub seq: u64,
    pub request_seq: u64,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

// seq is defaulted because some adapters omit it on events
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub seq: u64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Body of a failed response, when the adapter provides a structured error.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMessage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub id: u64,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_user: Option<bool>,
}

impl Response {
    /// The human readable failure reason carried by a failed response.
    pub fn error_message(&self) -> String {
        self.body
            .as_ref()
            .and_then(|body| serde_json::from_value::<ErrorResponse>(body.clone()).ok())
            .and_then(|body| body.error)
            .map(|error| error.format)
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| format!("{} failed", self.command))
    }
}

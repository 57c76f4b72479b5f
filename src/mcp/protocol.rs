//! JSON-RPC 2.0 message shapes used by the context protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision sent in the `initialize` handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Outgoing request
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    #[must_use]
    pub const fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// Outgoing notification (no id, no response)
#[derive(Debug, Serialize)]
pub struct JsonRpcNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcNotification<'a> {
    #[must_use]
    pub const fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Any incoming message
///
/// Responses carry `id` plus `result` or `error`. Server-initiated requests
/// and notifications carry `method` and are ignored by this client.
#[derive(Debug, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Numeric id of a response, if this message is one
    #[must_use]
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Error object in a response
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Tool definition returned by `tools/list`
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(default)]
    pub annotations: Option<McpToolAnnotations>,
}

/// Behavior hints a server may attach to a tool
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpToolAnnotations {
    #[serde(rename = "readOnlyHint", default)]
    pub read_only_hint: bool,
}

/// Page of `tools/list` results
#[derive(Debug, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

/// Result of `tools/call`
#[derive(Debug, Default, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Concatenate text blocks; non-text blocks are summarized by type
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.clone(),
                ContentBlock::Other { kind } => format!("[{kind} content]"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One block of tool output
#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text { text: String },
    Other { kind: String },
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Ok(match value.get("text").and_then(Value::as_str) {
            Some(text) if kind == "text" => Self::Text {
                text: text.to_string(),
            },
            _ => Self::Other { kind },
        })
    }
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

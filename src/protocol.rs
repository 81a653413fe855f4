//! Wire types for the remote tool protocol.
//!
//! Outgoing messages are JSON-RPC 2.0 requests and notifications. Incoming
//! messages are decoded once, at the edge, into [`IncomingMessage`] so the
//! dispatcher can match on them exhaustively instead of probing for keys.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version string sent on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version offered during the handshake.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// Protocol versions this client accepts from a server.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05", "2024-10-07"];

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_PING: &str = "ping";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// Standard JSON-RPC "method not found" code.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Standard JSON-RPC "internal error" code; stands in for a missing one.
pub const INTERNAL_ERROR: i64 = -32603;

// ============================================================================
// OUTGOING
// ============================================================================

/// A client → server request that expects a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A fire-and-forget message: no id, no response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Read an error object leniently.
    ///
    /// A response with a usable id must settle its request even when the
    /// server garbles the error, so a missing or non-integer `code` becomes
    /// [`INTERNAL_ERROR`] and a missing `message` becomes the raw JSON.
    pub fn from_value(value: Value) -> Self {
        if let Ok(error) = serde_json::from_value::<RpcError>(value.clone()) {
            return error;
        }
        let code = value
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or(INTERNAL_ERROR);
        let message = match value.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => value.to_string(),
        };
        let data = value.get("data").cloned();
        RpcError {
            code,
            message,
            data,
        }
    }
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        Error::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

// ============================================================================
// INCOMING
// ============================================================================

/// A decoded server → client message.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Answer to one of our requests
    Response {
        id: u64,
        outcome: std::result::Result<Value, RpcError>,
    },
    /// Server notification (logging, progress, list-changed…)
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Server → client request; this client implements none
    Request { id: Value, method: String },
}

/// Loose shape used only to classify a message.
#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

impl IncomingMessage {
    /// Decode one `message` frame payload.
    pub fn decode(data: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_str(data)?;
        Self::classify(raw)
    }

    fn classify(raw: RawMessage) -> Result<Self> {
        match (raw.method, raw.id) {
            (Some(method), Some(id)) if !id.is_null() => Ok(IncomingMessage::Request { id, method }),
            (Some(method), _) => Ok(IncomingMessage::Notification {
                method,
                params: raw.params,
            }),
            (None, Some(id)) => {
                let id = id.as_u64().ok_or_else(|| {
                    Error::protocol_violation(format!("response id {id} is not a request id"))
                })?;
                let outcome = match (raw.error, raw.result) {
                    (Some(error), _) => Err(RpcError::from_value(error)),
                    (None, result) => Ok(result.unwrap_or(Value::Null)),
                };
                Ok(IncomingMessage::Response { id, outcome })
            }
            (None, None) => Err(Error::protocol_violation(
                "message has neither an id nor a method",
            )),
        }
    }
}

// ============================================================================
// HANDSHAKE
// ============================================================================

/// Name and version of one side of the connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Default for Implementation {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: Implementation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<Implementation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// ============================================================================
// TOOLS
// ============================================================================

/// A tool as advertised by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: Value,
}

/// Result of `tools/call`.
///
/// `content` is kept as raw JSON: servers return either a list of content
/// blocks or, in simpler deployments, a bare string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Flatten the content into plain text.
    ///
    /// Strings pass through; text blocks are joined with newlines; anything
    /// else is rendered as JSON.
    pub fn text(&self) -> String {
        content_text(&self.content)
    }
}

/// Render tool content as text for the completion service.
pub fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) if !blocks.is_empty() && blocks.iter().all(is_text_block) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn is_text_block(block: &Value) -> bool {
    block.get("type").and_then(Value::as_str) == Some("text")
        && block.get("text").is_some_and(Value::is_string)
}

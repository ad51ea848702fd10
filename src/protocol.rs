//! Wire protocol model — JSON-RPC frames and the tool/prompt vocabulary.
//!
//! Every transport carries newline-delimited JSON objects of the shape
//! `{id?, method?, params?, result?, error?}`. The session layer correlates
//! requests and responses by `id`; frames without an `id` are
//! server-initiated notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision sent during the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// RPC method names understood by managed servers.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const LIST_TOOLS: &str = "tools/list";
    pub const CALL_TOOL: &str = "tools/call";
    pub const LIST_PROMPTS: &str = "prompts/list";
}

/// One JSON-RPC frame. Requests set `id` + `method`; responses set `id` +
/// (`result` | `error`); notifications set `method` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFrame {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

/// The `error` member of a response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcFrame {
    /// Build a request frame.
    pub fn request(id: u64, method: &str, params: Value) -> Self {
        RpcFrame {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a notification frame (no id, no response expected).
    pub fn notification(method: &str, params: Value) -> Self {
        RpcFrame {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// A response to some request (used by tests standing in for servers).
    pub fn response(id: u64, result: Value) -> Self {
        RpcFrame {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// An error response to some request.
    pub fn error_response(id: u64, code: i64, message: &str) -> Self {
        RpcFrame {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }

    /// True when the frame is a response (carries an id but no method).
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }

    /// True when the frame is a server-initiated notification.
    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }
}

/// Client identity sent with the initialize handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        ClientInfo {
            name: "cipher-fleet".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server identity returned by the initialize handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: String,
}

/// A tool as advertised by a managed server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A prompt as advertised by a managed server. Listing prompts doubles as
/// the liveness probe, so this stays deliberately small.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Result of a tool call on a managed server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub content: Value,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol payloads, and the launch
//! configuration for a single tool server.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Protocol revision sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `jsonrpc` is tolerated but not required; some servers omit it. A message
/// carrying `method` is a server-initiated request, not a response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub id: u64,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn is_server_request(&self) -> bool {
        self.method.is_some()
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

// ─── Launch Configuration ───────────────────────────────────────────────────

/// How the client talks to a tool server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Newline-delimited JSON-RPC over the child's stdin/stdout.
    #[default]
    Stdio,
}

/// Launch configuration for one tool server. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique key; also the routing name recorded in the registry.
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub transport: TransportKind,
    /// Layered on top of the inherited parent environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ServerConfig {
    /// Build a stdio server config with no extra environment.
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            transport: TransportKind::Stdio,
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema", alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A discovered tool bound to the server that advertised it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    /// Name exposed to the model (unique in the merged registry).
    pub name: String,
    /// Name the owning server knows the tool by.
    pub remote_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub server: String,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolListResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Result of a tool invocation that reached the server.
///
/// `success == false` is a recoverable tool error; channel failures are
/// reported as `McpError` instead.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub server: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl ToolCallResult {
    /// Human-readable text of the result, as fed back to the model.
    ///
    /// MCP results look like `{"content": [{"type": "text", "text": "..."}]}`;
    /// text items are joined with newlines, anything else is rendered as JSON.
    pub fn text(&self) -> String {
        if let Some(err) = &self.error {
            return err.clone();
        }
        let Some(value) = &self.result else {
            return "No result returned.".to_string();
        };

        if let Some(items) = value.get("content").and_then(|c| c.as_array()) {
            let texts: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect();
            if !texts.is_empty() {
                return texts.join("\n");
            }
        }

        serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
    }
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    pub const INTERNAL_ERROR: i32 = -32603;
}

//! MCP session error types.

use thiserror::Error;

/// Errors raised while launching, talking to, or aggregating tool servers.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process could not be started.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The `initialize` handshake failed or timed out.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// Malformed message or I/O failure on the stdio channel.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The server answered with a JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// `tools/list` failed or returned an unparseable catalog.
    #[error("tool discovery failed for server '{server}': {reason}")]
    DiscoveryFailed { server: String, reason: String },

    /// Two servers advertise the same tool name under the reject policy.
    #[error("duplicate tool '{tool}' advertised by servers '{first}' and '{second}'")]
    DuplicateTool {
        tool: String,
        first: String,
        second: String,
    },

    /// Tool not present in the merged registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Tool call arguments did not match the advertised input schema.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// A tool call did not complete within the per-call timeout.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// The server process exited or its channel is closed.
    #[error("server '{name}' crashed: {reason}")]
    ServerCrashed { name: String, reason: String },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted { name: String, attempts: u32 },
}

impl McpError {
    /// Whether this error means the owning session can no longer be used.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            McpError::ServerCrashed { .. } | McpError::TransportError { .. }
        )
    }
}

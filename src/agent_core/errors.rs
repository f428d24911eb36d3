//! Agent Core error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::InferenceError;
use crate::mcp_client::McpError;

/// Errors that abort a request (or agent construction).
///
/// Tool invocation failures inside the reasoning loop are normally recovered
/// by feeding them back to the model; `ToolInvocation` only surfaces when a
/// caller invokes a tool outside the loop.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A tool server failed to launch or handshake.
    #[error("failed to start tool server '{server}': {reason}")]
    ServerLaunch { server: String, reason: String },

    /// Tool discovery or registry construction failed.
    #[error("tool discovery failed: {reason}")]
    ToolDiscovery { reason: String },

    /// A tool call failed outside the recoverable path.
    #[error("tool '{tool}' failed: {reason}")]
    ToolInvocation { tool: String, reason: String },

    /// Malformed model output, unreachable model, or turn limit exceeded.
    #[error("reasoning loop failed: {reason}")]
    ReasoningLoop { reason: String },

    /// The interpretation pass failed.
    #[error("interpretation failed: {reason}")]
    Interpretation { reason: String },

    /// A tool server died mid-request; the agent session is unusable.
    #[error("lost session with tool server '{server}': {reason}")]
    SessionLost { server: String, reason: String },

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// The request itself was rejected before any work was done.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl AgentError {
    /// Stable machine-readable kind, used in [`RequestError`].
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::ServerLaunch { .. } => "server_launch",
            AgentError::ToolDiscovery { .. } => "tool_discovery",
            AgentError::ToolInvocation { .. } => "tool_invocation",
            AgentError::ReasoningLoop { .. } => "reasoning_loop",
            AgentError::Interpretation { .. } => "interpretation",
            AgentError::SessionLost { .. } => "session_lost",
            AgentError::Config { .. } => "config",
            AgentError::InvalidRequest { .. } => "invalid_request",
        }
    }

    pub fn is_session_lost(&self) -> bool {
        matches!(self, AgentError::SessionLost { .. })
    }
}

impl From<McpError> for AgentError {
    fn from(e: McpError) -> Self {
        match e {
            McpError::SpawnFailed { ref name, .. }
            | McpError::InitFailed { ref name, .. }
            | McpError::RestartExhausted { ref name, .. } => AgentError::ServerLaunch {
                server: name.clone(),
                reason: e.to_string(),
            },
            McpError::DiscoveryFailed { .. } | McpError::DuplicateTool { .. } => {
                AgentError::ToolDiscovery {
                    reason: e.to_string(),
                }
            }
            McpError::ServerCrashed { ref name, .. } => AgentError::SessionLost {
                server: name.clone(),
                reason: e.to_string(),
            },
            McpError::TransportError { ref server, .. } => AgentError::SessionLost {
                server: server.clone(),
                reason: e.to_string(),
            },
            McpError::UnknownTool { ref name } => AgentError::ToolInvocation {
                tool: name.clone(),
                reason: e.to_string(),
            },
            McpError::InvalidArguments { ref tool, .. } | McpError::Timeout { ref tool, .. } => {
                AgentError::ToolInvocation {
                    tool: tool.clone(),
                    reason: e.to_string(),
                }
            }
            McpError::ServerError { .. } => AgentError::ToolInvocation {
                tool: String::new(),
                reason: e.to_string(),
            },
        }
    }
}

impl From<InferenceError> for AgentError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::ConfigError { reason } => AgentError::Config { reason },
            other if other.is_unreachable() => AgentError::ReasoningLoop {
                reason: format!("model endpoint unreachable: {other}"),
            },
            other => AgentError::ReasoningLoop {
                reason: other.to_string(),
            },
        }
    }
}

// ─── RequestError ───────────────────────────────────────────────────────────

/// The structured failure returned to callers of `query`.
///
/// Serializes as `{"status": "error", "kind": ..., "message": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RequestError {
    pub status: String,
    pub kind: String,
    pub message: String,
}

impl RequestError {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

impl From<AgentError> for RequestError {
    fn from(e: AgentError) -> Self {
        RequestError::new(e.kind(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_tool_maps_to_discovery() {
        let err: AgentError = McpError::DuplicateTool {
            tool: "search".into(),
            first: "alpha".into(),
            second: "beta".into(),
        }
        .into();
        assert_eq!(err.kind(), "tool_discovery");
        let msg = err.to_string();
        assert!(msg.contains("alpha") && msg.contains("beta"));
    }

    #[test]
    fn test_crash_maps_to_session_lost() {
        let err: AgentError = McpError::ServerCrashed {
            name: "memory".into(),
            reason: "stdout closed".into(),
        }
        .into();
        assert!(err.is_session_lost());
        match err {
            AgentError::SessionLost { server, .. } => assert_eq!(server, "memory"),
            other => panic!("expected SessionLost, got {other:?}"),
        }
    }

    #[test]
    fn test_launch_failure_names_server() {
        let err: AgentError = McpError::InitFailed {
            name: "neo4j-cypher".into(),
            reason: "timed out".into(),
        }
        .into();
        assert_eq!(err.kind(), "server_launch");
        assert!(err.to_string().contains("neo4j-cypher"));
    }

    #[test]
    fn test_unreachable_endpoint_is_labelled() {
        let err = AgentError::from(InferenceError::ConnectionFailed {
            endpoint: "http://localhost:11434/v1".into(),
            reason: "connection refused".into(),
        });
        assert_eq!(err.kind(), "reasoning_loop");
        assert!(err.to_string().contains("model endpoint unreachable"));

        let err = AgentError::from(InferenceError::HttpError {
            status: 400,
            body: "bad request".into(),
        });
        assert!(!err.to_string().contains("unreachable"));
    }

    #[test]
    fn test_request_error_serialization() {
        let err: RequestError = AgentError::InvalidRequest {
            reason: "command cannot be empty".into(),
        }
        .into();
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["kind"], "invalid_request");
        assert!(json["message"].as_str().unwrap().contains("command cannot be empty"));
    }
}

//! ToolRouter — dispatches model tool calls to MCP servers.
//!
//! The ToolRouter is the bridge between the LLM's tool call decisions and the
//! tool servers. It handles:
//! - Validation (tool exists, arguments match schema)
//! - Concurrency: calls to different servers run in parallel, calls to the
//!   same server run one after another
//! - A per-call timeout
//! - Turning recoverable failures into `ERROR:` results for the model
//!
//! Results always come back in the order the model requested them.

use std::time::{Duration, Instant};

use crate::inference::types::ToolCall;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::registry::ToolRegistry;

use super::errors::AgentError;
use super::observer::{AgentEvent, ExecutionObserver};
use super::tokens::truncate_tool_result;

/// Prefix marking a tool result as a failure in the conversation.
pub const ERROR_MARKER: &str = "ERROR:";

/// Outcome of one tool call, ready to append to the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub call: ToolCall,
    /// Owning server; `None` when the tool is not registered.
    pub server: Option<String>,
    pub success: bool,
    /// Text for the model, truncated, `ERROR:`-prefixed on failure.
    pub output: String,
    pub elapsed_ms: u64,
}

/// Dispatches tool calls against one registry.
pub struct ToolRouter<'a> {
    registry: &'a ToolRegistry,
    tool_timeout: Duration,
    max_result_chars: usize,
}

impl<'a> ToolRouter<'a> {
    pub fn new(registry: &'a ToolRegistry, tool_timeout: Duration, max_result_chars: usize) -> Self {
        Self {
            registry,
            tool_timeout,
            max_result_chars,
        }
    }

    /// Dispatch a batch of tool calls from one decision step.
    ///
    /// Returns one outcome per call in request order. Fails only when an
    /// owning server died (`SessionLost`).
    pub async fn dispatch_tool_calls(
        &self,
        tool_calls: &[ToolCall],
        turn: u32,
        observer: &dyn ExecutionObserver,
    ) -> Result<Vec<ToolOutcome>, AgentError> {
        // Group call indices by owning server, preserving first-seen order.
        let mut groups: Vec<(Option<&str>, Vec<usize>)> = Vec::new();
        for (idx, call) in tool_calls.iter().enumerate() {
            let server = self.registry.get_server_for_tool(&call.name);
            match groups.iter_mut().find(|(s, _)| *s == server) {
                Some((_, indices)) => indices.push(idx),
                None => groups.push((server, vec![idx])),
            }
        }

        let runs = groups.iter().map(|(_, indices)| async move {
            let mut done = Vec::with_capacity(indices.len());
            for &idx in indices {
                let outcome = self.dispatch_single(&tool_calls[idx], turn, observer).await?;
                done.push((idx, outcome));
            }
            Ok::<_, AgentError>(done)
        });

        let mut slots: Vec<Option<ToolOutcome>> = vec![None; tool_calls.len()];
        for group in futures::future::join_all(runs).await {
            for (idx, outcome) in group? {
                slots[idx] = Some(outcome);
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Dispatch a single tool call: validate → invoke (with timeout) → shape.
    pub async fn dispatch_single(
        &self,
        tool_call: &ToolCall,
        turn: u32,
        observer: &dyn ExecutionObserver,
    ) -> Result<ToolOutcome, AgentError> {
        let start = Instant::now();
        let entry = self.registry.get(&tool_call.name);
        let server = entry.map(|e| e.descriptor.server.clone());

        observer.on_event(&AgentEvent::ToolStarted {
            turn,
            tool: tool_call.name.clone(),
            server: server.clone(),
        });

        let (success, output) = match entry {
            None => (false, self.unknown_tool_message(&tool_call.name)),
            Some(entry) => {
                if let Err(e) = self
                    .registry
                    .validate_tool_call(&tool_call.name, &tool_call.arguments)
                {
                    (false, format!("{ERROR_MARKER} {e}"))
                } else {
                    let invocation = entry
                        .session
                        .invoke_tool(&entry.descriptor.remote_name, tool_call.arguments.clone());
                    match tokio::time::timeout(self.tool_timeout, invocation).await {
                        Err(_) => {
                            let timeout = McpError::Timeout {
                                tool: tool_call.name.clone(),
                                timeout_ms: self.tool_timeout.as_millis() as u64,
                            };
                            (false, format!("{ERROR_MARKER} {timeout}"))
                        }
                        Ok(Err(e)) if e.is_session_fatal() => {
                            tracing::error!(
                                tool = %tool_call.name,
                                server = %entry.descriptor.server,
                                error = %e,
                                "tool server session lost"
                            );
                            return Err(AgentError::SessionLost {
                                server: entry.descriptor.server.clone(),
                                reason: e.to_string(),
                            });
                        }
                        Ok(Err(e)) => (false, format!("{ERROR_MARKER} {e}")),
                        Ok(Ok(result)) if result.success => (
                            true,
                            truncate_tool_result(&result.text(), self.max_result_chars),
                        ),
                        Ok(Ok(result)) => (
                            false,
                            format!(
                                "{ERROR_MARKER} {}",
                                truncate_tool_result(&result.text(), self.max_result_chars)
                            ),
                        ),
                    }
                }
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if success {
            tracing::debug!(tool = %tool_call.name, elapsed_ms, "tool call succeeded");
        } else {
            tracing::warn!(tool = %tool_call.name, elapsed_ms, output = %output, "tool call failed");
        }
        observer.on_event(&AgentEvent::ToolFinished {
            turn,
            tool: tool_call.name.clone(),
            server: server.clone(),
            success,
            elapsed_ms,
        });

        Ok(ToolOutcome {
            call: tool_call.clone(),
            server,
            success,
            output,
            elapsed_ms,
        })
    }

    fn unknown_tool_message(&self, name: &str) -> String {
        let suggestions = self.registry.find_similar(name, 3);
        if suggestions.is_empty() {
            format!(
                "{ERROR_MARKER} unknown tool '{name}'. Available tools: {}",
                self.registry.tool_names().join(", ")
            )
        } else {
            format!(
                "{ERROR_MARKER} unknown tool '{name}'. Did you mean: {}?",
                suggestions.join(", ")
            )
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

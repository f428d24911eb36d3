//! Execution observers — tracing hooks for the reasoning loop.
//!
//! Observers see every state transition, decision and tool call. They never
//! influence the outcome of a request.

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::LoopState;

/// Something that happened while serving a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    StateChanged {
        turn: u32,
        state: LoopState,
    },
    Decision {
        turn: u32,
        content: Option<String>,
        tool_calls: Vec<String>,
    },
    ToolStarted {
        turn: u32,
        tool: String,
        server: Option<String>,
    },
    ToolFinished {
        turn: u32,
        tool: String,
        server: Option<String>,
        success: bool,
        elapsed_ms: u64,
    },
    Interpreted {
        answer: String,
    },
}

/// Receives agent events. Must be cheap and must not block.
pub trait ExecutionObserver: Send + Sync {
    fn on_event(&self, event: &AgentEvent);
}

/// Observer that ignores everything (non-verbose requests).
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {
    fn on_event(&self, _event: &AgentEvent) {}
}

/// A recorded event with its timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub at: DateTime<Utc>,
    /// Milliseconds since the recorder was created.
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub event: AgentEvent,
}

/// Verbose-mode observer: logs every event and keeps it for the result.
pub struct TraceRecorder {
    request_id: String,
    started: Instant,
    events: Mutex<Vec<TraceEvent>>,
}

impl TraceRecorder {
    pub fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            started: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Drain the recorded events.
    pub fn take_events(&self) -> Vec<TraceEvent> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *events)
    }
}

impl ExecutionObserver for TraceRecorder {
    fn on_event(&self, event: &AgentEvent) {
        match event {
            AgentEvent::StateChanged { turn, state } => {
                tracing::debug!(request_id = %self.request_id, turn, %state, "loop state");
            }
            AgentEvent::Decision {
                turn,
                content,
                tool_calls,
            } => {
                tracing::info!(
                    request_id = %self.request_id,
                    turn,
                    content = content.as_deref().unwrap_or(""),
                    tool_calls = ?tool_calls,
                    "model decision"
                );
            }
            AgentEvent::ToolStarted { turn, tool, server } => {
                tracing::info!(
                    request_id = %self.request_id,
                    turn,
                    tool = %tool,
                    server = server.as_deref().unwrap_or("-"),
                    "tool call started"
                );
            }
            AgentEvent::ToolFinished {
                turn,
                tool,
                server,
                success,
                elapsed_ms,
            } => {
                tracing::info!(
                    request_id = %self.request_id,
                    turn,
                    tool = %tool,
                    server = server.as_deref().unwrap_or("-"),
                    success,
                    elapsed_ms,
                    "tool call finished"
                );
            }
            AgentEvent::Interpreted { answer } => {
                tracing::info!(request_id = %self.request_id, answer = %answer, "interpreted answer");
            }
        }

        let recorded = TraceEvent {
            at: Utc::now(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            event: event.clone(),
        };
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(recorded);
    }
}

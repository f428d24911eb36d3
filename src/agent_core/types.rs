//! Shared types for the agent core.
//!
//! Execution traces, request results, loop limits and usage accounting used
//! across the ReasoningAgent, ResponseInterpreter and ExecutionDriver.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::observer::TraceEvent;
use crate::inference::types::{TokenUsage, ToolCall};

// ─── Loop State ─────────────────────────────────────────────────────────────

/// Where a request is in the reason-act state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    AwaitingInput,
    LlmDeciding,
    ToolExecuting,
    FinalAnswer,
    Done,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::AwaitingInput => "awaiting_input",
            LoopState::LlmDeciding => "llm_deciding",
            LoopState::ToolExecuting => "tool_executing",
            LoopState::FinalAnswer => "final_answer",
            LoopState::Done => "done",
        };
        f.write_str(s)
    }
}

// ─── Execution Trace ────────────────────────────────────────────────────────

/// One step of a reasoning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEntry {
    Request {
        text: String,
    },
    Decision {
        turn: u32,
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        turn: u32,
        tool: String,
        server: Option<String>,
        success: bool,
        output: String,
    },
    FinalAnswer {
        turn: u32,
        content: String,
    },
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEntry::Request { text } => write!(f, "User request: {text}"),
            TraceEntry::Decision {
                turn,
                content,
                tool_calls,
            } => {
                if let Some(text) = content {
                    writeln!(f, "[turn {turn}] Assistant: {text}")?;
                }
                let calls: Vec<String> = tool_calls
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.arguments))
                    .collect();
                write!(f, "[turn {turn}] Tool calls: {}", calls.join("; "))
            }
            TraceEntry::ToolResult {
                turn,
                tool,
                server,
                output,
                ..
            } => match server {
                Some(server) => write!(f, "[turn {turn}] {tool} @ {server} -> {output}"),
                None => write!(f, "[turn {turn}] {tool} -> {output}"),
            },
            TraceEntry::FinalAnswer { turn, content } => {
                write!(f, "[turn {turn}] Final answer: {content}")
            }
        }
    }
}

/// Ordered record of everything the reasoning loop did for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub entries: Vec<TraceEntry>,
}

impl ExecutionTrace {
    pub fn new(request: &str) -> Self {
        Self {
            entries: vec![TraceEntry::Request {
                text: request.to_string(),
            }],
        }
    }

    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    /// The model's final answer, if the loop reached one.
    pub fn final_answer(&self) -> Option<&str> {
        self.entries.iter().rev().find_map(|e| match e {
            TraceEntry::FinalAnswer { content, .. } => Some(content.as_str()),
            _ => None,
        })
    }

    pub fn tool_call_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, TraceEntry::ToolResult { .. }))
            .count()
    }

    /// Text rendering, one entry per line.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ExecutionTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

// ─── Limits ─────────────────────────────────────────────────────────────────

/// Termination and size bounds for the reasoning loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimits {
    /// Maximum LLM decision steps per request.
    pub max_turns: u32,
    /// Deadline for each LLM call (reasoning and interpretation).
    pub llm_timeout_secs: u64,
    /// Deadline for each tool call.
    pub tool_timeout_secs: u64,
    /// Tool results longer than this many characters are truncated.
    pub max_tool_result_chars: usize,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_turns: 10,
            llm_timeout_secs: 120,
            tool_timeout_secs: 30,
            max_tool_result_chars: 6000,
        }
    }
}

impl AgentLimits {
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

// ─── Usage Accounting ───────────────────────────────────────────────────────

/// Per-request token accounting scope.
///
/// Disabled meters ignore everything and report `None`.
#[derive(Debug, Clone, Default)]
pub struct UsageMeter {
    enabled: bool,
    total: TokenUsage,
    calls: u32,
}

impl UsageMeter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn record(&mut self, usage: Option<&TokenUsage>) {
        if !self.enabled {
            return;
        }
        if let Some(usage) = usage {
            self.total.add(usage);
            self.calls += 1;
        }
    }

    /// Summed usage, or `None` when disabled or nothing was reported.
    pub fn finish(&self) -> Option<TokenUsage> {
        (self.enabled && self.calls > 0).then_some(self.total)
    }
}

// ─── Results ────────────────────────────────────────────────────────────────

/// Outcome of one `run` call. Ephemeral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    pub raw_trace: String,
    pub interpreted_answer: String,
    pub elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Recorded only in verbose mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<TraceEvent>,
}

/// Successful `query` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: String,
    pub result: String,
    pub raw: String,
    pub seconds_to_complete: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<TraceEvent>,
}

impl From<RequestResult> for QueryResponse {
    fn from(r: RequestResult) -> Self {
        Self {
            status: "success".to_string(),
            result: r.interpreted_answer,
            raw: r.raw_trace,
            seconds_to_complete: round2(r.elapsed_seconds),
            usage: r.usage,
            events: r.events,
        }
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_trace() -> ExecutionTrace {
        let mut trace = ExecutionTrace::new("How many nodes are in the graph?");
        trace.push(TraceEntry::Decision {
            turn: 1,
            content: None,
            tool_calls: vec![ToolCall {
                id: "call_1".into(),
                name: "run_query".into(),
                arguments: serde_json::json!({"query": "MATCH (n) RETURN count(n) AS count"}),
            }],
        });
        trace.push(TraceEntry::ToolResult {
            turn: 1,
            tool: "run_query".into(),
            server: Some("neo4j-cypher".into()),
            success: true,
            output: "{\"count\": 28}".into(),
        });
        trace.push(TraceEntry::FinalAnswer {
            turn: 2,
            content: "28".into(),
        });
        trace
    }

    #[test]
    fn test_trace_render() {
        let trace = scenario_trace();
        let raw = trace.render();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines[0], "User request: How many nodes are in the graph?");
        assert!(lines[1].starts_with("[turn 1] Tool calls: run_query"));
        assert_eq!(lines[2], "[turn 1] run_query @ neo4j-cypher -> {\"count\": 28}");
        assert_eq!(lines[3], "[turn 2] Final answer: 28");
        assert_eq!(trace.final_answer(), Some("28"));
        assert_eq!(trace.tool_call_count(), 1);
    }

    #[test]
    fn test_limits_defaults_and_partial_yaml() {
        let limits: AgentLimits = serde_yaml::from_str("max_turns: 4").unwrap();
        assert_eq!(limits.max_turns, 4);
        assert_eq!(limits.tool_timeout(), Duration::from_secs(30));
        assert_eq!(limits.llm_timeout(), Duration::from_secs(120));
        assert_eq!(limits.max_tool_result_chars, 6000);
    }

    #[test]
    fn test_usage_meter() {
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
        };

        let mut disabled = UsageMeter::new(false);
        disabled.record(Some(&usage));
        assert!(disabled.finish().is_none());

        let mut enabled = UsageMeter::new(true);
        assert!(enabled.finish().is_none());
        enabled.record(Some(&usage));
        enabled.record(None);
        enabled.record(Some(&usage));
        assert_eq!(enabled.finish().unwrap().total_tokens, 240);
    }

    #[test]
    fn test_query_response_from_result() {
        let result = RequestResult {
            raw_trace: scenario_trace().render(),
            interpreted_answer: "28".into(),
            elapsed_seconds: 1.23456,
            usage: None,
            events: Vec::new(),
        };
        let resp = QueryResponse::from(result);
        assert_eq!(resp.status, "success");
        assert_eq!(resp.seconds_to_complete, 1.23);
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("usage").is_none());
        assert!(json.get("events").is_none());
    }
}

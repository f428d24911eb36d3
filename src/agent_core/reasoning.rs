//! ReasoningAgent — the bounded reason-act loop.
//!
//! Per request:
//! `AWAITING_INPUT → LLM_DECIDING → (TOOL_EXECUTING → LLM_DECIDING)* → FINAL_ANSWER → DONE`
//!
//! Every decision sees the full conversation. Tool failures are fed back to
//! the model; a dead tool server, an unreachable model, an empty reply or
//! running out of turns ends the request.

use std::sync::Arc;

use crate::inference::client::ChatModel;
use crate::inference::types::{SamplingOverrides, ToolDefinition};
use crate::mcp_client::registry::ToolRegistry;

use super::conversation::Conversation;
use super::errors::AgentError;
use super::observer::{AgentEvent, ExecutionObserver};
use super::tool_router::ToolRouter;
use super::types::{AgentLimits, ExecutionTrace, LoopState, TraceEntry, UsageMeter};

const SYSTEM_PROMPT_PREAMBLE: &str = "You are a helpful assistant that answers questions by \
calling tools exposed by external servers. Use the tools to look facts up instead of guessing. \
If a tool result starts with ERROR:, fix the call or try a different tool. \
When you have enough information, reply with the answer and do not call any more tools.";

/// Drives one model against one tool registry.
pub struct ReasoningAgent {
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    tool_definitions: Vec<ToolDefinition>,
    system_prompt: String,
    limits: AgentLimits,
}

impl ReasoningAgent {
    pub fn new(model: Arc<dyn ChatModel>, registry: Arc<ToolRegistry>, limits: AgentLimits) -> Self {
        let tool_definitions = registry
            .descriptors()
            .map(|d| ToolDefinition::function(&d.name, &d.description, d.input_schema.clone()))
            .collect();
        let system_prompt = format!("{SYSTEM_PROMPT_PREAMBLE}\n\n{}", registry.capability_summary());

        Self {
            model,
            registry,
            tool_definitions,
            system_prompt,
            limits,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn limits(&self) -> &AgentLimits {
        &self.limits
    }

    /// Run the loop for one request and return its trace.
    ///
    /// The trace always ends with a `FinalAnswer` entry on success.
    pub async fn run(
        &self,
        request: &str,
        observer: &dyn ExecutionObserver,
        usage: &mut UsageMeter,
    ) -> Result<ExecutionTrace, AgentError> {
        let mut trace = ExecutionTrace::new(request);
        let mut conversation = Conversation::new(&self.system_prompt, request);
        let router = ToolRouter::new(
            &self.registry,
            self.limits.tool_timeout(),
            self.limits.max_tool_result_chars,
        );
        let tools = (!self.tool_definitions.is_empty()).then_some(self.tool_definitions.as_slice());

        observer.on_event(&AgentEvent::StateChanged {
            turn: 0,
            state: LoopState::AwaitingInput,
        });

        for turn in 1..=self.limits.max_turns {
            observer.on_event(&AgentEvent::StateChanged {
                turn,
                state: LoopState::LlmDeciding,
            });
            tracing::debug!(
                model = self.model.model_id(),
                turn,
                messages = conversation.len(),
                est_tokens = conversation.estimated_tokens(),
                "requesting model decision"
            );

            let completion = self.model.complete(
                conversation.messages(),
                tools,
                SamplingOverrides::default(),
            );
            let response = tokio::time::timeout(self.limits.llm_timeout(), completion)
                .await
                .map_err(|_| AgentError::ReasoningLoop {
                    reason: format!(
                        "model '{}' did not respond within {}s",
                        self.model.model_id(),
                        self.limits.llm_timeout_secs
                    ),
                })??;
            usage.record(response.usage.as_ref());

            observer.on_event(&AgentEvent::Decision {
                turn,
                content: response.content.clone(),
                tool_calls: response.tool_calls.iter().map(|c| c.name.clone()).collect(),
            });

            if !response.wants_tools() {
                let answer = response
                    .content
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| AgentError::ReasoningLoop {
                        reason: format!("model returned an empty response on turn {turn}"),
                    })?;

                conversation.add_assistant_message(&answer);
                trace.push(TraceEntry::FinalAnswer {
                    turn,
                    content: answer,
                });
                observer.on_event(&AgentEvent::StateChanged {
                    turn,
                    state: LoopState::FinalAnswer,
                });
                tracing::info!(
                    model = self.model.model_id(),
                    turns = turn,
                    tool_calls = trace.tool_call_count(),
                    "reasoning loop finished"
                );
                return Ok(trace);
            }

            trace.push(TraceEntry::Decision {
                turn,
                content: response.content.clone(),
                tool_calls: response.tool_calls.clone(),
            });
            conversation.add_tool_call_message(response.content.clone(), &response.tool_calls);

            observer.on_event(&AgentEvent::StateChanged {
                turn,
                state: LoopState::ToolExecuting,
            });
            let outcomes = router
                .dispatch_tool_calls(&response.tool_calls, turn, observer)
                .await?;

            for outcome in outcomes {
                conversation.add_tool_result_message(&outcome.call.id, &outcome.output);
                trace.push(TraceEntry::ToolResult {
                    turn,
                    tool: outcome.call.name,
                    server: outcome.server,
                    success: outcome.success,
                    output: outcome.output,
                });
            }
        }

        tracing::warn!(
            model = self.model.model_id(),
            max_turns = self.limits.max_turns,
            "reasoning loop hit the turn limit"
        );
        Err(AgentError::ReasoningLoop {
            reason: format!(
                "no final answer after {} turns",
                self.limits.max_turns
            ),
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

//! ResponseInterpreter — second model pass that turns a raw trace into a
//! concise answer.

use std::sync::Arc;
use std::time::Duration;

use crate::inference::client::ChatModel;
use crate::inference::types::{ChatMessage, SamplingOverrides};

use super::errors::AgentError;
use super::types::UsageMeter;

/// Build the single-message interpretation prompt.
pub fn interpretation_prompt(request: &str, raw_trace: &str) -> String {
    format!(
        "You are an expert assistant. Given the following user request and the raw agent/tool \
response, return the most appropriate response to answer the user request.\n\
User request: {request}\n\
Agent/tool response: {raw_trace}\n\
Answer:"
    )
}

/// Deterministic summarizer over the same model the agent reasoned with.
pub struct ResponseInterpreter {
    model: Arc<dyn ChatModel>,
    timeout: Duration,
}

impl ResponseInterpreter {
    pub fn new(model: Arc<dyn ChatModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    /// Produce the final answer text.
    ///
    /// No tools are offered and sampling is pinned to temperature 0. Any
    /// failure, including an empty reply, is an `Interpretation` error.
    pub async fn interpret(
        &self,
        request: &str,
        raw_trace: &str,
        usage: &mut UsageMeter,
    ) -> Result<String, AgentError> {
        let messages = [ChatMessage::user(&interpretation_prompt(request, raw_trace))];

        let completion = self
            .model
            .complete(&messages, None, SamplingOverrides::deterministic());
        let response = tokio::time::timeout(self.timeout, completion)
            .await
            .map_err(|_| AgentError::Interpretation {
                reason: format!(
                    "model '{}' did not respond within {}s",
                    self.model.model_id(),
                    self.timeout.as_secs()
                ),
            })?
            .map_err(|e| AgentError::Interpretation {
                reason: e.to_string(),
            })?;
        usage.record(response.usage.as_ref());

        let answer = response
            .content
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        if answer.is_empty() {
            return Err(AgentError::Interpretation {
                reason: "model returned an empty answer".to_string(),
            });
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::reasoning::tests::{answer, ScriptedModel};
    use crate::inference::types::{ModelResponse, Role};

    #[test]
    fn test_prompt_layout() {
        let prompt = interpretation_prompt("How many nodes?", "[turn 1] Final answer: 28");
        assert!(prompt.starts_with("You are an expert assistant."));
        assert!(prompt.contains("\nUser request: How many nodes?\n"));
        assert!(prompt.contains("\nAgent/tool response: [turn 1] Final answer: 28\n"));
        assert!(prompt.ends_with("Answer:"));
    }

    #[tokio::test]
    async fn test_interpret_trims_answer() {
        let model = Arc::new(ScriptedModel::new(vec![answer("  28\n")]));
        let interpreter = ResponseInterpreter::new(model.clone(), Duration::from_secs(5));
        let out = interpreter
            .interpret("How many nodes?", "raw", &mut UsageMeter::new(false))
            .await
            .unwrap();
        assert_eq!(out, "28");

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0].len(), 1);
        assert_eq!(seen[0][0].role, Role::User);
    }

    #[tokio::test]
    async fn test_empty_answer_is_error() {
        let model = Arc::new(ScriptedModel::new(vec![ModelResponse {
            content: Some("   ".into()),
            ..ModelResponse::default()
        }]));
        let interpreter = ResponseInterpreter::new(model, Duration::from_secs(5));
        let err = interpreter
            .interpret("q", "raw", &mut UsageMeter::new(false))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Interpretation { .. }));
    }
}

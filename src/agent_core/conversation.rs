//! Conversation — the per-request message history fed to the model.
//!
//! Lives only for the duration of one request:
//! `[system, user, (assistant tool_calls, tool results)*, assistant]`.

use crate::inference::types::{ChatMessage, ToolCall};

use super::tokens;

/// Ordered message history for one reasoning run.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    /// Start a conversation with the system prompt and the user's request.
    pub fn new(system_prompt: &str, request: &str) -> Self {
        Self {
            messages: vec![ChatMessage::system(system_prompt), ChatMessage::user(request)],
        }
    }

    /// Record the assistant turn that requested tool calls.
    pub fn add_tool_call_message(&mut self, content: Option<String>, calls: &[ToolCall]) {
        self.messages
            .push(ChatMessage::assistant_tool_calls(content, calls));
    }

    /// Record one tool result answering `tool_call_id`.
    pub fn add_tool_result_message(&mut self, tool_call_id: &str, output: &str) {
        self.messages.push(ChatMessage::tool(tool_call_id, output));
    }

    pub fn add_assistant_message(&mut self, content: &str) {
        self.messages.push(ChatMessage::assistant(content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Rough prompt size, for logging.
    pub fn estimated_tokens(&self) -> u32 {
        self.messages.iter().map(tokens::estimate_message_tokens).sum()
    }
}

//! Inference Client — OpenAI-compatible API client for chat models.
//!
//! This module handles all communication with the model endpoint:
//! - Non-streaming chat completions with native tool calls
//! - Tool call parsing (native JSON + JSON-in-content fallback)
//! - Per-model profiles resolved from the agent configuration
//!
//! The client speaks the OpenAI Chat Completions API, so switching between
//! Ollama-served models and hosted endpoints is a config change.

pub mod client;
pub mod config;
pub mod errors;
pub mod tool_call_parser;
pub mod types;

// Re-exports for convenience
pub use client::{ChatModel, InferenceClient};
pub use config::{ModelProfile, ModelsConfig, ResolvedModel};
pub use errors::InferenceError;
pub use types::{
    ChatMessage, ModelResponse, Role, SamplingOverrides, TokenUsage, ToolCall, ToolDefinition,
};

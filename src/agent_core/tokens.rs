//! Token estimation and tool-result truncation.
//!
//! Uses character-based heuristics calibrated for LLM tokenizers:
//! - English prose: ~3.2 chars/token (conservative, overestimates)
//! - JSON/structured content: ~2.8 chars/token (denser due to punctuation, short keys)

use crate::inference::types::{ChatMessage, Role};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Average characters per token for JSON/structured content.
const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-message overhead (role label, formatting tokens).
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Overhead for tool call JSON structure (per call).
const TOOL_CALL_OVERHEAD_TOKENS: u32 = 10;

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_chars` characters.
///
/// Always cuts on a char boundary, so multi-byte text never panics.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Cap a tool result before it enters the conversation.
///
/// Oversized results get a trailing notice so the model knows data is missing.
pub fn truncate_tool_result(output: &str, max_chars: usize) -> String {
    let kept = truncate_chars(output, max_chars);
    if kept.len() == output.len() {
        return output.to_string();
    }
    let total = output.chars().count();
    format!("{kept}\n...[truncated: showing {max_chars} of {total} characters]")
}

// ─── Estimation ─────────────────────────────────────────────────────────────

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as f64 / CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for JSON/structured content.
pub fn estimate_json_tokens(json_text: &str) -> u32 {
    (json_text.len() as f64 / JSON_CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for a `ChatMessage`.
///
/// Tool results and tool call arguments use the JSON ratio; everything else
/// uses the prose ratio.
pub fn estimate_message_tokens(message: &ChatMessage) -> u32 {
    let mut total = MESSAGE_OVERHEAD_TOKENS;

    if let Some(ref content) = message.content {
        total += match message.role {
            Role::Tool => estimate_json_tokens(content),
            _ => estimate_tokens(content),
        };
    }

    if let Some(ref calls) = message.tool_calls {
        for call in calls {
            total += TOOL_CALL_OVERHEAD_TOKENS;
            total += estimate_tokens(&call.function.name);
            total += estimate_json_tokens(&call.function.arguments);
        }
    }

    if let Some(ref id) = message.tool_call_id {
        total += estimate_tokens(id);
    }

    total
}

// ─── Tests ──────────────────────────────────────────────────────────────────

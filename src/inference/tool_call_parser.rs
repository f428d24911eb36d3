//! Tool call parsing — normalizes model output to `ToolCall` structs.
//!
//! Two sources are supported:
//!
//! 1. **Native calls** — the OpenAI `tool_calls` array, with JSON-encoded
//!    arguments. Malformed argument JSON goes through a repair pass before
//!    it is rejected.
//!
//! 2. **JSON in content** — small local models served through Ollama often
//!    ignore the `tools` channel and answer with a bare object instead:
//!    ```text
//!    {"name": "read_neo4j_cypher", "parameters": {"query": "MATCH (n) RETURN count(n)"}}
//!    ```
//!    This is only accepted when the name is a registered tool, so a final
//!    answer that happens to be JSON is never mistaken for a call.

use uuid::Uuid;

use super::errors::InferenceError;
use super::types::ToolCall;

// ─── Native JSON Parsing ─────────────────────────────────────────────────────

/// Parse one native tool call from the response's `tool_calls` array.
pub fn parse_native_json_tool_call(
    id: Option<&str>,
    name: &str,
    arguments_json: &str,
) -> Result<ToolCall, InferenceError> {
    let call_id = id
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(new_call_id);

    if name.is_empty() {
        return Err(InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason: "empty tool name".into(),
        });
    }

    let arguments = if arguments_json.trim().is_empty() {
        serde_json::json!({})
    } else {
        match serde_json::from_str::<serde_json::Value>(arguments_json) {
            Ok(v) => v,
            Err(e) => {
                let repaired = repair_malformed_tool_call_json(arguments_json).ok_or_else(|| {
                    InferenceError::ToolCallParseError {
                        raw_response: arguments_json.to_string(),
                        reason: format!("invalid JSON arguments: {e}"),
                    }
                })?;
                tracing::info!(tool = name, "repaired malformed JSON tool call arguments");
                repaired
            }
        }
    };

    Ok(ToolCall {
        id: call_id,
        name: name.to_string(),
        arguments: normalize_arguments(arguments),
    })
}

// ─── JSON-in-Content Parsing ─────────────────────────────────────────────────

/// Interpret assistant text as a single tool call, if it is one.
///
/// Accepts `{"name": ..., "arguments": {...}}` or `{"name": ..., "parameters": {...}}`,
/// optionally wrapped in a Markdown code fence. `is_known` gates the name.
pub fn parse_json_content_tool_call(
    content: &str,
    is_known: impl Fn(&str) -> bool,
) -> Option<ToolCall> {
    let body = strip_code_fence(content.trim());
    if !body.starts_with('{') {
        return None;
    }

    let value: serde_json::Value = serde_json::from_str(body)
        .ok()
        .or_else(|| repair_malformed_tool_call_json(body))?;
    let obj = value.as_object()?;

    let name = obj.get("name").and_then(|n| n.as_str())?;
    if !is_known(name) {
        return None;
    }

    let arguments = obj
        .get("arguments")
        .or_else(|| obj.get("parameters"))
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    // Some models double-encode: "arguments": "{\"query\": ...}"
    let arguments = match arguments {
        serde_json::Value::String(s) => {
            serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))
        }
        other => other,
    };

    Some(ToolCall {
        id: new_call_id(),
        name: name.to_string(),
        arguments: normalize_arguments(arguments),
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// `null` arguments are treated as "no arguments".
fn normalize_arguments(arguments: serde_json::Value) -> serde_json::Value {
    if arguments.is_null() {
        serde_json::json!({})
    } else {
        arguments
    }
}

fn new_call_id() -> String {
    format!("call_{}", Uuid::new_v4())
}

// ─── Malformed JSON Repair ──────────────────────────────────────────────────

/// Attempt to repair malformed JSON arguments from a model tool call.
///
/// Common malformations from small local models:
/// 1. Double quotes: `"key":""value"` (extra quote before value)
/// 2. Trailing commas: `{"a":1,}`
/// 3. Missing closing brace (unbalanced)
/// 4. Unescaped control characters in string values
///
/// Returns `Some(value)` if repair succeeds, `None` if irreparable.
pub fn repair_malformed_tool_call_json(raw: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(raw) {
        return Some(v);
    }

    let mut repaired = raw.to_string();
    let passes: [fn(&str) -> String; 4] = [
        repair_double_quotes,
        repair_trailing_commas,
        repair_unbalanced_braces,
        repair_control_characters,
    ];
    for pass in passes {
        repaired = pass(&repaired);
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
            return Some(v);
        }
    }

    None
}

/// Collapse `:""value` to `:"value`, leaving a legitimate `:""` alone.
fn repair_double_quotes(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if i + 2 < bytes.len() && bytes[i] == b':' && bytes[i + 1] == b'"' && bytes[i + 2] == b'"'
        {
            if i + 3 < bytes.len() && bytes[i + 3] != b',' && bytes[i + 3] != b'}' {
                result.push(b':');
                result.push(b'"');
                i += 3;
                continue;
            }
        }
        result.push(bytes[i]);
        i += 1;
    }

    String::from_utf8(result).unwrap_or_else(|_| input.to_string())
}

/// Remove trailing commas before `}` or `]`.
fn repair_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut result = String::with_capacity(input.len());

    for (i, &ch) in chars.iter().enumerate() {
        if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        result.push(ch);
    }

    result
}

/// Append closing braces to balance unmatched opening braces.
fn repair_unbalanced_braces(input: &str) -> String {
    let mut brace_depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for ch in input.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if !in_string {
            if ch == '{' {
                brace_depth += 1;
            } else if ch == '}' {
                brace_depth -= 1;
            }
        }
    }

    let mut result = input.to_string();
    for _ in 0..brace_depth.max(0) {
        result.push('}');
    }
    result
}

/// Remove non-printable control characters that break JSON parsing.
fn repair_control_characters(input: &str) -> String {
    input
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\r' || c == '\t')
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

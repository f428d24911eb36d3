//! OpenAI-compatible inference client.
//!
//! Sends non-streaming chat completion requests to the model endpoint named
//! by a resolved [`ModelProfile`](super::config::ModelProfile) and parses the
//! reply into a [`ModelResponse`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;

use super::config::ResolvedModel;
use super::errors::InferenceError;
use super::tool_call_parser::{parse_json_content_tool_call, parse_native_json_tool_call};
use super::types::{
    ChatCompletionRequest, ChatMessage, ModelResponse, SamplingOverrides, TokenUsage,
    ToolDefinition,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout. The per-call deadline is enforced by the caller.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── ChatModel ───────────────────────────────────────────────────────────────

/// A chat-completion backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Identifier the model was resolved for.
    fn model_id(&self) -> &str;

    /// Whether responses carry token usage worth accounting.
    fn supports_usage_accounting(&self) -> bool {
        false
    }

    /// One non-streaming completion over the full message sequence.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        sampling: SamplingOverrides,
    ) -> Result<ModelResponse, InferenceError>;
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for one model on an OpenAI-compatible endpoint.
pub struct InferenceClient {
    http: HttpClient,
    model: ResolvedModel,
}

impl InferenceClient {
    /// Create a client for a resolved model. Does NOT check connectivity.
    pub fn new(model: ResolvedModel) -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: model.profile.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { http, model })
    }

    pub fn model(&self) -> &ResolvedModel {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.model.profile.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatModel for InferenceClient {
    fn model_id(&self) -> &str {
        &self.model.id
    }

    fn supports_usage_accounting(&self) -> bool {
        self.model.profile.supports_usage_accounting
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        sampling: SamplingOverrides,
    ) -> Result<ModelResponse, InferenceError> {
        let url = self.endpoint();
        let tools = tools.filter(|t| !t.is_empty());

        let body = ChatCompletionRequest {
            model: self.model.wire_name.clone(),
            messages: messages.to_vec(),
            tools: tools.map(<[ToolDefinition]>::to_vec),
            tool_choice: tools.map(|_| "auto".to_string()),
            temperature: sampling
                .temperature
                .unwrap_or(self.model.profile.temperature),
            max_tokens: self.model.profile.max_tokens,
            stream: false,
        };

        tracing::debug!(
            model = %self.model.id,
            messages = messages.len(),
            tools = tools.map_or(0, |t| t.len()),
            temperature = body.temperature,
            "sending chat completion"
        );

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = self.model.profile.api_key() {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::MalformedResponse {
                reason: format!("failed to read response body: {e}"),
            })?;

        let known: Vec<&str> = tools
            .unwrap_or_default()
            .iter()
            .map(|t| t.function.name.as_str())
            .collect();
        parse_non_streaming_response(&body_text, &known)
    }
}

// ─── Response Parsing ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct NonStreamResponse {
    choices: Vec<NonStreamChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct NonStreamChoice {
    message: NonStreamMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct NonStreamMessage {
    content: Option<String>,
    tool_calls: Option<Vec<NonStreamToolCall>>,
}

#[derive(Deserialize)]
struct NonStreamToolCall {
    id: Option<String>,
    function: NonStreamFunction,
}

#[derive(Deserialize)]
struct NonStreamFunction {
    name: String,
    #[serde(default, deserialize_with = "arguments_as_string")]
    arguments: String,
}

/// Ollama sometimes returns `arguments` as an object instead of a string.
fn arguments_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Parse a complete chat completion body.
///
/// `known_tools` gates the JSON-in-content fallback: content is only read as
/// a tool call when the model emitted no native calls and the named tool was
/// offered in the request.
pub fn parse_non_streaming_response(
    body: &str,
    known_tools: &[&str],
) -> Result<ModelResponse, InferenceError> {
    let resp: NonStreamResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::MalformedResponse {
            reason: format!("failed to parse chat completion: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::MalformedResponse {
            reason: "empty choices array".into(),
        })?;

    let content = choice.message.content.filter(|c| !c.trim().is_empty());

    let mut tool_calls = Vec::new();
    for tc in choice.message.tool_calls.unwrap_or_default() {
        tool_calls.push(parse_native_json_tool_call(
            tc.id.as_deref(),
            &tc.function.name,
            &tc.function.arguments,
        )?);
    }

    let mut content = content;
    if tool_calls.is_empty() && !known_tools.is_empty() {
        if let Some(text) = content.as_deref() {
            if let Some(call) =
                parse_json_content_tool_call(text, |name| known_tools.contains(&name))
            {
                tracing::debug!(tool = %call.name, "parsed tool call from message content");
                tool_calls.push(call);
                content = None;
            }
        }
    }

    Ok(ModelResponse {
        content,
        tool_calls,
        usage: resp.usage,
        finish_reason: choice.finish_reason,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::config::ModelsConfig;

    #[test]
    fn test_parse_text_answer_with_usage() {
        let body = r#"{
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "There are 28 nodes."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 120, "completion_tokens": 8, "total_tokens": 128}
        }"#;
        let resp = parse_non_streaming_response(body, &[]).unwrap();
        assert_eq!(resp.content.as_deref(), Some("There are 28 nodes."));
        assert!(!resp.wants_tools());
        assert_eq!(resp.usage.unwrap().total_tokens, 128);
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_native_tool_calls() {
        let body = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [
                        {"id": "call_a", "type": "function",
                         "function": {"name": "read_neo4j_cypher", "arguments": "{\"query\": \"MATCH (n) RETURN count(n)\"}"}},
                        {"type": "function",
                         "function": {"name": "get_neo4j_schema", "arguments": {}}}
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;
        let resp = parse_non_streaming_response(body, &["read_neo4j_cypher"]).unwrap();
        assert!(resp.content.is_none());
        assert_eq!(resp.tool_calls.len(), 2);
        assert_eq!(resp.tool_calls[0].id, "call_a");
        assert_eq!(resp.tool_calls[1].name, "get_neo4j_schema");
        assert!(resp.tool_calls[1].id.starts_with("call_"));
        assert!(resp.usage.is_none());
    }

    #[test]
    fn test_parse_content_fallback_only_for_offered_tools() {
        let body = r#"{"choices": [{"message": {"content": "{\"name\": \"read_neo4j_cypher\", \"parameters\": {\"query\": \"RETURN 1\"}}"}}]}"#;

        let resp = parse_non_streaming_response(body, &["read_neo4j_cypher"]).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert!(resp.content.is_none());

        let resp = parse_non_streaming_response(body, &[]).unwrap();
        assert!(resp.tool_calls.is_empty());
        assert!(resp.content.is_some());
    }

    #[test]
    fn test_parse_empty_choices() {
        let err = parse_non_streaming_response(r#"{"choices": []}"#, &[]).unwrap_err();
        assert!(matches!(err, InferenceError::MalformedResponse { .. }));
    }

    #[test]
    fn test_client_reports_profile_capabilities() {
        let mut config = ModelsConfig::default();
        config.default_profile.supports_usage_accounting = true;
        config.default_profile.base_url = "http://localhost:11434/v1/".into();
        let client = InferenceClient::new(config.resolve("llama3.1").unwrap()).unwrap();
        assert_eq!(client.model_id(), "llama3.1");
        assert!(client.supports_usage_accounting());
        assert_eq!(client.endpoint(), "http://localhost:11434/v1/chat/completions");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_failure() {
        let mut config = ModelsConfig::default();
        config.default_profile.base_url = "http://127.0.0.1:9/v1".into();
        let client = InferenceClient::new(config.resolve("llama3.1").unwrap()).unwrap();
        let err = client
            .complete(&[ChatMessage::user("hi")], None, SamplingOverrides::default())
            .await
            .unwrap_err();
        assert!(err.is_unreachable(), "got {err:?}");
    }
}

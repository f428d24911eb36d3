//! ExecutionDriver — the inbound entry point.
//!
//! Resolves the model identifier, fetches (or builds) the cached agent
//! session and runs reasoning plus interpretation under wall-clock timing.
//! A tool server that died is restarted in place; the session is evicted
//! only when that fails.

use std::sync::Arc;
use std::time::Instant;

use crate::config::AgentConfig;

use super::cache::{AgentCache, SlotStatus};
use super::errors::{AgentError, RequestError};
use super::session::{McpSessionFactory, SessionFactory};
use super::types::{QueryResponse, RequestResult};

pub struct ExecutionDriver {
    cache: AgentCache,
    default_model: String,
}

impl ExecutionDriver {
    pub fn new(factory: Arc<dyn SessionFactory>, default_model: &str) -> Self {
        Self {
            cache: AgentCache::new(factory),
            default_model: default_model.trim().to_string(),
        }
    }

    /// Driver over real MCP servers and model endpoints.
    pub fn from_config(config: AgentConfig) -> Self {
        let default_model = config.models.default_model.clone();
        Self::new(Arc::new(McpSessionFactory::new(config)), &default_model)
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Cache key for a caller-supplied model identifier.
    fn model_key<'a>(&'a self, model_id: &'a str) -> &'a str {
        match model_id.trim() {
            "" => self.default_model.as_str(),
            id => id,
        }
    }

    /// Serve one request.
    ///
    /// `elapsed_seconds` spans session start-up (on first use of a model),
    /// reasoning and interpretation.
    pub async fn run(
        &self,
        request: &str,
        model_id: &str,
        verbose: bool,
    ) -> Result<RequestResult, AgentError> {
        let request = request.trim();
        if request.is_empty() {
            return Err(AgentError::InvalidRequest {
                reason: "command must not be empty".to_string(),
            });
        }
        let model_id = self.model_key(model_id);
        let started = Instant::now();

        let session = self.cache.get_or_init(model_id).await?;
        match session.execute(request, verbose).await {
            Ok(mut result) => {
                result.elapsed_seconds = started.elapsed().as_secs_f64();
                tracing::info!(
                    model = %model_id,
                    elapsed_secs = result.elapsed_seconds,
                    "request completed"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!(model = %model_id, kind = e.kind(), error = %e, "request failed");
                if let AgentError::SessionLost { server, .. } = &e {
                    if !session.recover(server).await {
                        self.cache.invalidate(model_id, &session).await;
                    }
                }
                Err(e)
            }
        }
    }

    /// The `query(command, model)` operation.
    pub async fn query(&self, command: &str, model: &str) -> Result<QueryResponse, RequestError> {
        self.query_with(command, model, false).await
    }

    /// `query` with optional verbose tracing; recorded events are returned in
    /// the response.
    pub async fn query_with(
        &self,
        command: &str,
        model: &str,
        verbose: bool,
    ) -> Result<QueryResponse, RequestError> {
        self.run(command, model, verbose)
            .await
            .map(QueryResponse::from)
            .map_err(RequestError::from)
    }

    pub fn cache_status(&self) -> Vec<(String, SlotStatus)> {
        self.cache.status()
    }

    /// Tear down every cached session.
    pub async fn shutdown(&self) {
        self.cache.shutdown_all().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::agent_core::reasoning::tests::{answer, tool_call, ScriptedModel};
    use crate::agent_core::session::tests::StubFactory;
    use crate::agent_core::session::AgentSession;
    use crate::agent_core::tool_router::ERROR_MARKER;
    use crate::agent_core::types::AgentLimits;
    use crate::inference::client::ChatModel;
    use crate::inference::errors::InferenceError;
    use crate::inference::types::{
        ChatMessage, ModelResponse, Role, SamplingOverrides, ToolDefinition,
    };
    use crate::mcp_client::errors::McpError;
    use crate::mcp_client::registry::tests::tool;
    use crate::mcp_client::registry::{CollisionPolicy, ToolRegistry};
    use crate::mcp_client::session::ToolServer;
    use crate::mcp_client::types::{McpToolDefinition, ToolCallResult};

    #[tokio::test]
    async fn test_query_scenario() {
        let driver = ExecutionDriver::new(Arc::new(StubFactory::new()), "llama3.1");
        let response = driver
            .query("How many nodes are in the graph?", "")
            .await
            .unwrap();

        assert_eq!(response.status, "success");
        assert_eq!(response.result, "28");
        assert!(response.raw.contains("run_query"));
        assert!(response.raw.contains("28"));
        assert!(response.seconds_to_complete >= 0.0);
        assert_eq!(
            driver.cache_status(),
            vec![("llama3.1".to_string(), SlotStatus::Ready)]
        );
    }

    #[tokio::test]
    async fn test_session_reused_across_requests() {
        let factory = Arc::new(StubFactory::new());
        let driver = ExecutionDriver::new(factory.clone(), "llama3.1");
        driver
            .run("How many nodes are in the graph?", "llama3.1", false)
            .await
            .unwrap();
        driver
            .run("How many nodes are in the graph?", " llama3.1 ", false)
            .await
            .unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
    }

    /// Model whose reply depends only on the messages it is shown.
    ///
    /// The interpretation pass (a single user message) is summarized from
    /// the trace; otherwise the model queries once, then answers from the
    /// latest tool result.
    struct ConversationModel;

    #[async_trait]
    impl ChatModel for ConversationModel {
        fn model_id(&self) -> &str {
            "conversation"
        }

        async fn complete(
            &self,
            messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
            _sampling: SamplingOverrides,
        ) -> Result<ModelResponse, InferenceError> {
            if let [prompt] = messages {
                let trace = prompt.content.as_deref().unwrap_or_default();
                let summary = if trace.contains(ERROR_MARKER) {
                    "the query failed"
                } else if trace.contains("28") {
                    "28"
                } else {
                    "no data"
                };
                return Ok(answer(summary));
            }

            let tool_output = messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Tool)
                .and_then(|m| m.content.clone());
            Ok(match tool_output {
                Some(output) => answer(&format!("The query returned {output}")),
                None => tool_call(
                    "call_1",
                    "run_query",
                    serde_json::json!({"query": "MATCH (n) RETURN count(n) AS count"}),
                ),
            })
        }
    }

    /// In-memory graph server; `fail` makes every call come back `isError`.
    struct GraphServer {
        fail: bool,
    }

    #[async_trait]
    impl ToolServer for GraphServer {
        fn name(&self) -> &str {
            "neo4j-cypher"
        }

        async fn discover_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
            Ok(vec![tool(
                "run_query",
                serde_json::json!({"type": "object", "required": ["query"]}),
            )])
        }

        async fn invoke_tool(
            &self,
            tool_name: &str,
            _arguments: serde_json::Value,
        ) -> Result<ToolCallResult, McpError> {
            let text = if self.fail {
                "Neo.ClientError.Statement.SyntaxError: Invalid input"
            } else {
                "{\"count\": 28}"
            };
            Ok(ToolCallResult {
                tool_name: tool_name.to_string(),
                server: "neo4j-cypher".into(),
                success: !self.fail,
                result: Some(serde_json::json!({
                    "content": [{"type": "text", "text": text}],
                    "isError": self.fail,
                })),
                error: None,
                execution_time_ms: 3,
            })
        }

        async fn shutdown(&self) {}
    }

    struct GraphFactory {
        fail: bool,
    }

    #[async_trait]
    impl SessionFactory for GraphFactory {
        async fn build(&self, model_id: &str) -> Result<AgentSession, AgentError> {
            let server: Arc<dyn ToolServer> = Arc::new(GraphServer { fail: self.fail });
            let registry = ToolRegistry::aggregate(&[server], CollisionPolicy::Reject).await?;
            Ok(AgentSession::new(
                model_id,
                Arc::new(ConversationModel),
                Arc::new(registry),
                AgentLimits::default(),
                None,
            ))
        }
    }

    #[tokio::test]
    async fn test_repeated_query_is_identical() {
        let driver = ExecutionDriver::new(Arc::new(GraphFactory { fail: false }), "llama3.1");
        let first = driver.query("How many nodes are in the graph?", "").await.unwrap();
        let second = driver.query("How many nodes are in the graph?", "").await.unwrap();

        assert_eq!(first.status, "success");
        assert_eq!(first.result, "28");
        assert_eq!(first.status, second.status);
        assert_eq!(first.result, second.result);
        assert_eq!(first.raw, second.raw);
        assert!(first.raw.contains("run_query @ neo4j-cypher -> {\"count\": 28}"));
    }

    #[tokio::test]
    async fn test_tool_error_is_answered_by_model() {
        let driver = ExecutionDriver::new(Arc::new(GraphFactory { fail: true }), "llama3.1");
        let response = driver.query("How many nodes are in the graph?", "").await.unwrap();

        assert_eq!(response.status, "success");
        assert_eq!(response.result, "the query failed");
        assert!(response
            .raw
            .contains("-> ERROR: Neo.ClientError.Statement.SyntaxError"));
        assert!(response.raw.contains("Final answer: The query returned ERROR:"));
        assert_eq!(
            driver.cache_status(),
            vec![("llama3.1".to_string(), SlotStatus::Ready)]
        );
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let factory = Arc::new(StubFactory::new());
        let driver = ExecutionDriver::new(factory.clone(), "llama3.1");
        let err = driver.query("   ", "llama3.1").await.unwrap_err();
        assert_eq!(err.status, "error");
        assert_eq!(err.kind, "invalid_request");
        assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_is_structured_error() {
        let factory = Arc::new(StubFactory::new());
        factory.fail_first.store(1, Ordering::SeqCst);
        let driver = ExecutionDriver::new(factory.clone(), "llama3.1");

        let err = driver.query("How many nodes are in the graph?", "").await.unwrap_err();
        assert_eq!(err.kind, "server_launch");
        assert!(err.message.contains("neo4j-cypher"));

        // The failed entry is retried on the next request.
        let ok = driver.query("How many nodes are in the graph?", "").await.unwrap();
        assert_eq!(ok.result, "28");
    }

    struct DeadServer;

    #[async_trait]
    impl ToolServer for DeadServer {
        fn name(&self) -> &str {
            "neo4j-cypher"
        }

        async fn discover_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
            Ok(vec![tool("run_query", serde_json::json!({"type": "object"}))])
        }

        async fn invoke_tool(
            &self,
            _tool_name: &str,
            _arguments: serde_json::Value,
        ) -> Result<ToolCallResult, McpError> {
            Err(McpError::ServerCrashed {
                name: "neo4j-cypher".into(),
                reason: "stdout closed".into(),
            })
        }

        async fn shutdown(&self) {}
    }

    struct DeadServerFactory {
        builds: AtomicUsize,
    }

    #[async_trait]
    impl SessionFactory for DeadServerFactory {
        async fn build(&self, model_id: &str) -> Result<AgentSession, AgentError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let server: Arc<dyn ToolServer> = Arc::new(DeadServer);
            let registry =
                ToolRegistry::aggregate(&[server], CollisionPolicy::Reject).await?;
            let model = ScriptedModel::new(vec![tool_call(
                "call_1",
                "run_query",
                serde_json::json!({"query": "RETURN 1"}),
            )]);
            Ok(AgentSession::new(
                model_id,
                Arc::new(model),
                Arc::new(registry),
                AgentLimits::default(),
                None,
            ))
        }
    }

    #[tokio::test]
    async fn test_session_lost_invalidates_cache() {
        let factory = Arc::new(DeadServerFactory {
            builds: AtomicUsize::new(0),
        });
        let driver = ExecutionDriver::new(factory.clone(), "llama3.1");

        let err = driver.run("How many nodes?", "", false).await.err().unwrap();
        assert!(err.is_session_lost());
        assert_eq!(
            driver.cache_status(),
            vec![("llama3.1".to_string(), SlotStatus::Uninitialized)]
        );

        let err = driver.query("How many nodes?", "").await.unwrap_err();
        assert_eq!(err.kind, "session_lost");
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
    }

    #[cfg(unix)]
    struct ProcessFactory {
        builds: AtomicUsize,
    }

    #[cfg(unix)]
    #[async_trait]
    impl SessionFactory for ProcessFactory {
        async fn build(&self, model_id: &str) -> Result<AgentSession, AgentError> {
            use crate::mcp_client::client::McpClient;
            use crate::mcp_client::session::tests::SCRIPTED_SERVER;
            use crate::mcp_client::types::ServerConfig;

            self.builds.fetch_add(1, Ordering::SeqCst);
            let configs = vec![ServerConfig::stdio("neo4j-cypher", "sh", &["-c", SCRIPTED_SERVER])];
            let pool = McpClient::spawn_all(&configs).await?;
            let registry =
                ToolRegistry::aggregate(&pool.tool_servers(), CollisionPolicy::Reject).await?;
            Ok(AgentSession::new(
                model_id,
                Arc::new(ConversationModel),
                Arc::new(registry),
                AgentLimits::default(),
                Some(pool),
            ))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dead_server_restarted_without_rebuilding_session() {
        let factory = Arc::new(ProcessFactory {
            builds: AtomicUsize::new(0),
        });
        let driver = ExecutionDriver::new(factory.clone(), "llama3.1");

        let ok = driver.query("How many nodes are in the graph?", "").await.unwrap();
        assert_eq!(ok.result, "28");

        let session = driver.cache.get_or_init("llama3.1").await.unwrap();
        let handle = Arc::clone(session.pool().unwrap().get("neo4j-cypher").unwrap());
        handle.shutdown().await;

        let err = driver.query("How many nodes are in the graph?", "").await.unwrap_err();
        assert_eq!(err.kind, "session_lost");
        assert_eq!(handle.restart_count(), 1);
        assert!(handle.is_alive().await);
        assert_eq!(
            driver.cache_status(),
            vec![("llama3.1".to_string(), SlotStatus::Ready)]
        );

        let again = driver.query("How many nodes are in the graph?", "").await.unwrap();
        assert_eq!(again.result, "28");
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);

        driver.shutdown().await;
    }
}

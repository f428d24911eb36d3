//! AgentSession — everything needed to serve requests for one model.
//!
//! A session owns a running tool-server pool, the aggregated registry, a
//! model client, the reasoning agent and the interpreter. Sessions are built
//! by a [`SessionFactory`] and cached per model identifier by
//! [`AgentCache`](super::cache::AgentCache).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::config::AgentConfig;
use crate::inference::client::{ChatModel, InferenceClient};
use crate::mcp_client::client::McpClient;
use crate::mcp_client::registry::ToolRegistry;

use super::errors::AgentError;
use super::interpreter::ResponseInterpreter;
use super::observer::{AgentEvent, ExecutionObserver, NoopObserver, TraceRecorder};
use super::reasoning::ReasoningAgent;
use super::types::{AgentLimits, LoopState, RequestResult, UsageMeter};

/// A ready-to-serve agent bound to one model.
pub struct AgentSession {
    model_id: String,
    agent: ReasoningAgent,
    interpreter: ResponseInterpreter,
    usage_accounting: bool,
    pool: Option<McpClient>,
}

impl AgentSession {
    /// Assemble a session from its parts.
    ///
    /// `pool` is the set of server processes behind `registry`; it is shut
    /// down with the session. Sessions over in-process servers pass `None`.
    pub fn new(
        model_id: &str,
        model: Arc<dyn ChatModel>,
        registry: Arc<ToolRegistry>,
        limits: AgentLimits,
        pool: Option<McpClient>,
    ) -> Self {
        let usage_accounting = model.supports_usage_accounting();
        let interpreter = ResponseInterpreter::new(Arc::clone(&model), limits.llm_timeout());
        let agent = ReasoningAgent::new(model, registry, limits);
        Self {
            model_id: model_id.to_string(),
            agent,
            interpreter,
            usage_accounting,
            pool,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.agent.registry()
    }

    pub fn pool(&self) -> Option<&McpClient> {
        self.pool.as_ref()
    }

    /// Reason over the request, then interpret the trace.
    ///
    /// `elapsed_seconds` covers this call only; the driver replaces it with
    /// a wall-clock figure that includes session start-up.
    pub async fn execute(&self, request: &str, verbose: bool) -> Result<RequestResult, AgentError> {
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        let recorder = verbose.then(|| TraceRecorder::new(&request_id));
        let observer: &dyn ExecutionObserver = match &recorder {
            Some(recorder) => recorder,
            None => &NoopObserver,
        };
        let mut usage = UsageMeter::new(self.usage_accounting);

        tracing::info!(request_id = %request_id, model = %self.model_id, verbose, "executing request");

        let trace = self.agent.run(request, observer, &mut usage).await?;
        let raw_trace = trace.render();

        let answer = self
            .interpreter
            .interpret(request, &raw_trace, &mut usage)
            .await?;
        observer.on_event(&AgentEvent::Interpreted {
            answer: answer.clone(),
        });
        observer.on_event(&AgentEvent::StateChanged {
            turn: 0,
            state: LoopState::Done,
        });

        Ok(RequestResult {
            raw_trace,
            interpreted_answer: answer,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            usage: usage.finish(),
            events: recorder.map(|r| r.take_events()).unwrap_or_default(),
        })
    }

    /// Relaunch one dead tool server in place, leaving the others running.
    ///
    /// Returns `false` when the session owns no process pool, the server is
    /// not part of it, or the restart failed; the session is then unusable.
    pub async fn recover(&self, server: &str) -> bool {
        let Some(pool) = &self.pool else {
            return false;
        };
        match pool.restart_server(server).await {
            Ok(()) => {
                tracing::info!(model = %self.model_id, server, "tool server recovered");
                true
            }
            Err(e) => {
                tracing::error!(model = %self.model_id, server, error = %e, "tool server recovery failed");
                false
            }
        }
    }

    /// Stop every server process owned by this session.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            tracing::info!(model = %self.model_id, servers = pool.len(), "shutting down agent session");
            pool.shutdown_all().await;
        }
    }
}

// ─── Factory ────────────────────────────────────────────────────────────────

/// Builds agent sessions on first use of a model identifier.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn build(&self, model_id: &str) -> Result<AgentSession, AgentError>;
}

/// Production factory: launches the configured MCP servers and connects to
/// the model's OpenAI-compatible endpoint.
pub struct McpSessionFactory {
    config: AgentConfig,
}

impl McpSessionFactory {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

#[async_trait]
impl SessionFactory for McpSessionFactory {
    async fn build(&self, model_id: &str) -> Result<AgentSession, AgentError> {
        let resolved = self.config.models.resolve(model_id)?;
        tracing::info!(
            model = %resolved.id,
            wire_name = %resolved.wire_name,
            base_url = %resolved.profile.base_url,
            servers = self.config.servers.len(),
            "building agent session"
        );
        let model: Arc<dyn ChatModel> = Arc::new(InferenceClient::new(resolved)?);

        let pool = McpClient::spawn_all(&self.config.servers).await?;
        let mut registry =
            match ToolRegistry::aggregate(&pool.tool_servers(), self.config.collision_policy).await {
                Ok(registry) => registry,
                Err(e) => {
                    pool.shutdown_all().await;
                    return Err(e.into());
                }
            };

        if let Some(enabled) = &self.config.enabled_tools {
            let allowed: HashSet<String> = enabled.iter().cloned().collect();
            registry.retain_tools(&allowed);
        }
        tracing::info!(model = %model.model_id(), tools = registry.len(), "tool registry ready");

        Ok(AgentSession::new(
            model.model_id(),
            Arc::clone(&model),
            Arc::new(registry),
            self.config.limits.clone(),
            Some(pool),
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::agent_core::reasoning::tests::{answer, graph_registry, tool_call, ScriptedModel};

    /// Factory that builds sessions over the in-memory graph registry and
    /// counts how often it was asked.
    pub(crate) struct StubFactory {
        pub builds: AtomicUsize,
        pub fail_first: AtomicUsize,
        pub delay: std::time::Duration,
    }

    impl StubFactory {
        pub(crate) fn new() -> Self {
            Self {
                builds: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
                delay: std::time::Duration::ZERO,
            }
        }
    }

    pub(crate) fn scenario_model() -> ScriptedModel {
        ScriptedModel::new(vec![
            tool_call(
                "call_1",
                "run_query",
                serde_json::json!({"query": "MATCH (n) RETURN count(n) AS count"}),
            ),
            answer("28"),
            answer("28"),
        ])
    }

    #[async_trait]
    impl SessionFactory for StubFactory {
        async fn build(&self, model_id: &str) -> Result<AgentSession, AgentError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AgentError::ServerLaunch {
                    server: "neo4j-cypher".into(),
                    reason: "spawn failed".into(),
                });
            }
            Ok(AgentSession::new(
                model_id,
                Arc::new(scenario_model()),
                graph_registry(),
                AgentLimits::default(),
                None,
            ))
        }
    }

    #[tokio::test]
    async fn test_execute_scenario() {
        let session = StubFactory::new().build("llama3.1").await.unwrap();
        let result = session
            .execute("How many nodes are in the graph?", false)
            .await
            .unwrap();
        assert_eq!(result.interpreted_answer, "28");
        assert!(result.raw_trace.contains("run_query"));
        assert!(result.elapsed_seconds >= 0.0);
        assert!(result.usage.is_none());
        assert!(result.events.is_empty());
    }

    #[tokio::test]
    async fn test_verbose_records_events() {
        let session = StubFactory::new().build("llama3.1").await.unwrap();
        let result = session
            .execute("How many nodes are in the graph?", true)
            .await
            .unwrap();
        assert_eq!(result.interpreted_answer, "28");
        assert!(result
            .events
            .iter()
            .any(|e| matches!(&e.event, AgentEvent::ToolFinished { tool, success: true, .. } if tool == "run_query")));
        assert!(matches!(
            result.events.last().map(|e| &e.event),
            Some(AgentEvent::StateChanged {
                state: LoopState::Done,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_usage_summed_when_supported() {
        let mut model = scenario_model();
        model.usage_accounting = true;
        let session = AgentSession::new(
            "metered",
            Arc::new(model),
            graph_registry(),
            AgentLimits::default(),
            None,
        );
        let result = session
            .execute("How many nodes are in the graph?", false)
            .await
            .unwrap();
        // tool call (60) + final answer (82) + interpretation (82)
        assert_eq!(result.usage.unwrap().total_tokens, 224);
    }

    #[tokio::test]
    async fn test_recover_needs_a_process_pool() {
        let session = StubFactory::new().build("llama3.1").await.unwrap();
        assert!(!session.recover("neo4j-cypher").await);
    }

    #[tokio::test]
    async fn test_factory_reports_unknown_command() {
        let mut config = AgentConfig::default();
        config.servers = vec![crate::mcp_client::types::ServerConfig::stdio(
            "missing",
            "/nonexistent/mcp-server-binary",
            &[],
        )];
        let factory = McpSessionFactory::new(config);
        let err = factory.build("llama3.1").await.err().unwrap();
        assert!(matches!(err, AgentError::ServerLaunch { ref server, .. } if server == "missing"));
    }
}

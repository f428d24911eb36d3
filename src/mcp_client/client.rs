//! MCP Client — the pool of tool-server sessions.
//!
//! Launches every configured server in parallel (fail-fast), hands out one
//! restartable [`ServerHandle`] per server, and tears everything down.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio::time::sleep;

use super::errors::McpError;
use super::session::{McpSession, ToolServer};
use super::types::{McpToolDefinition, ServerConfig, ToolCallResult};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum restart attempts before giving up on a server.
const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Base delay between restart attempts (doubles each time).
const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

// ─── ServerHandle ────────────────────────────────────────────────────────────

/// Stable handle to one server whose underlying session can be swapped.
///
/// The registry binds tools to the handle, so a restart is picked up by
/// every later invocation without rebuilding the registry.
pub struct ServerHandle {
    config: ServerConfig,
    session: RwLock<Arc<McpSession>>,
    restart_count: AtomicU32,
    restart_base_delay: Duration,
}

impl ServerHandle {
    fn new(config: ServerConfig, session: McpSession) -> Self {
        Self {
            config,
            session: RwLock::new(Arc::new(session)),
            restart_count: AtomicU32::new(0),
            restart_base_delay: RESTART_BASE_DELAY,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// How many restart attempts have been made, successful or not.
    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Acquire)
    }

    pub async fn is_alive(&self) -> bool {
        self.current().await.is_alive().await
    }

    async fn current(&self) -> Arc<McpSession> {
        Arc::clone(&*self.session.read().await)
    }

    /// Relaunch the server with exponential backoff (1s, 2s, 4s).
    ///
    /// Every attempt counts against the budget, including launches that
    /// fail, so a server that keeps dying ends in `RestartExhausted`.
    pub async fn restart(&self) -> Result<(), McpError> {
        let attempt = self
            .restart_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_RESTART_ATTEMPTS).then_some(n + 1)
            })
            .map_err(|_| McpError::RestartExhausted {
                name: self.config.name.clone(),
                attempts: MAX_RESTART_ATTEMPTS,
            })?;

        let delay = self.restart_base_delay * 2u32.pow(attempt);
        tracing::warn!(
            server = %self.config.name,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "restarting tool server"
        );
        sleep(delay).await;

        let fresh = match McpSession::launch(&self.config).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                tracing::error!(
                    server = %self.config.name,
                    attempt = attempt + 1,
                    error = %e,
                    "tool server restart failed"
                );
                return Err(e);
            }
        };

        let old = {
            let mut slot = self.session.write().await;
            std::mem::replace(&mut *slot, fresh)
        };
        old.shutdown().await;
        tracing::info!(server = %self.config.name, attempt = attempt + 1, "tool server restarted");
        Ok(())
    }
}

#[async_trait]
impl ToolServer for ServerHandle {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn discover_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        self.current().await.discover_tools().await
    }

    async fn invoke_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        self.current().await.invoke_tool(tool_name, arguments).await
    }

    async fn shutdown(&self) {
        self.current().await.shutdown().await;
    }
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// All live tool-server sessions for one agent, in configuration order.
pub struct McpClient {
    servers: Vec<Arc<ServerHandle>>,
}

impl McpClient {
    /// Launch every configured server concurrently.
    ///
    /// Fail-fast: the first server to fail its launch or handshake aborts
    /// the launches still in flight, the servers that did start are shut
    /// down, and that failure is returned naming the server. On success the
    /// handles are in configuration order.
    pub async fn spawn_all(configs: &[ServerConfig]) -> Result<Self, McpError> {
        let mut aborts = Vec::with_capacity(configs.len());
        let mut launches = FuturesUnordered::new();
        for (index, config) in configs.iter().cloned().enumerate() {
            let task = tokio::spawn(async move {
                let session = McpSession::launch(&config).await?;
                Ok::<_, McpError>(ServerHandle::new(config, session))
            });
            aborts.push(task.abort_handle());
            launches.push(task.map(move |joined| (index, joined)));
        }

        let mut started = Vec::with_capacity(configs.len());
        let mut failure: Option<McpError> = None;
        while let Some((index, joined)) = launches.next().await {
            let name = &configs[index].name;
            match joined {
                Ok(Ok(server)) => started.push((index, Arc::new(server))),
                Ok(Err(e)) => {
                    tracing::error!(server = %name, error = %e, "tool server failed to start");
                    failure = Some(e);
                    break;
                }
                Err(e) => {
                    failure = Some(McpError::SpawnFailed {
                        name: name.clone(),
                        reason: format!("launch task failed: {e}"),
                    });
                    break;
                }
            }
        }

        if let Some(err) = failure {
            aborts.iter().for_each(AbortHandle::abort);
            drop(launches);
            let client = Self::from_handles(started.into_iter().map(|(_, s)| s).collect());
            client.shutdown_all().await;
            return Err(err);
        }

        started.sort_by_key(|(index, _)| *index);
        let client = Self::from_handles(started.into_iter().map(|(_, s)| s).collect());
        tracing::info!(servers = client.len(), "all tool servers started");
        Ok(client)
    }

    /// Build a client around already-constructed handles.
    pub fn from_handles(servers: Vec<Arc<ServerHandle>>) -> Self {
        Self { servers }
    }

    /// Handles as `ToolServer` trait objects, for registry aggregation.
    pub fn tool_servers(&self) -> Vec<Arc<dyn ToolServer>> {
        self.servers
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn ToolServer>)
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServerHandle>> {
        self.servers.iter().find(|s| s.config.name == name)
    }

    /// Restart one server by name without touching the others.
    pub async fn restart_server(&self, name: &str) -> Result<(), McpError> {
        let server = self.get(name).ok_or_else(|| McpError::ServerCrashed {
            name: name.to_string(),
            reason: "server not configured in this pool".into(),
        })?;
        server.restart().await
    }

    /// Shut down all servers concurrently.
    pub async fn shutdown_all(&self) {
        futures::future::join_all(self.servers.iter().map(|s| s.shutdown())).await;
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.config.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_all_empty() {
        let client = McpClient::spawn_all(&[]).await.unwrap();
        assert!(client.is_empty());
        assert!(client.tool_servers().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_all_fails_fast_naming_server() {
        let configs = vec![ServerConfig::stdio(
            "neo4j-data-modeling",
            "definitely-not-a-real-binary-4242",
            &[],
        )];
        let err = McpClient::spawn_all(&configs).await.err().unwrap();
        assert!(err.to_string().contains("neo4j-data-modeling"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_all_shuts_down_started_servers_on_failure() {
        use crate::mcp_client::session::tests::SCRIPTED_SERVER;

        let configs = vec![
            ServerConfig::stdio("scripted", "sh", &["-c", SCRIPTED_SERVER]),
            ServerConfig::stdio("broken", "sh", &["-c", "exit 3"]),
        ];
        let err = McpClient::spawn_all(&configs).await.err().unwrap();
        match err {
            McpError::InitFailed { name, .. } => assert_eq!(name, "broken"),
            other => panic!("expected InitFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_server_swaps_session() {
        use crate::mcp_client::session::tests::SCRIPTED_SERVER;

        let configs = vec![ServerConfig::stdio("scripted", "sh", &["-c", SCRIPTED_SERVER])];
        let client = McpClient::spawn_all(&configs).await.unwrap();
        assert_eq!(client.server_names(), vec!["scripted"]);

        let handle = Arc::clone(client.get("scripted").unwrap());
        handle.shutdown().await;
        assert!(!handle.is_alive().await);

        client.restart_server("scripted").await.unwrap();
        assert_eq!(handle.restart_count(), 1);
        assert!(handle.is_alive().await);

        let result = handle
            .invoke_tool("run_query", serde_json::json!({"query": "RETURN 1"}))
            .await
            .unwrap();
        assert!(result.success);

        client.shutdown_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_all_does_not_wait_for_slow_handshakes() {
        let configs = vec![
            ServerConfig::stdio("silent", "sh", &["-c", "sleep 60"]),
            ServerConfig::stdio("broken", "sh", &["-c", "exit 3"]),
        ];
        let err = tokio::time::timeout(Duration::from_secs(10), McpClient::spawn_all(&configs))
            .await
            .expect("spawn_all waited for the silent server's handshake")
            .err()
            .unwrap();
        assert!(err.to_string().contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_restarts_back_off_then_exhaust() {
        use crate::mcp_client::session::tests::SCRIPTED_SERVER;

        let first = ServerConfig::stdio("flaky", "sh", &["-c", SCRIPTED_SERVER]);
        let session = McpSession::launch(&first).await.unwrap();
        // Starts once, then every relaunch exits immediately.
        let handle = ServerHandle {
            config: ServerConfig::stdio("flaky", "sh", &["-c", "exit 1"]),
            session: RwLock::new(Arc::new(session)),
            restart_count: AtomicU32::new(0),
            restart_base_delay: Duration::from_millis(10),
        };

        let started = std::time::Instant::now();
        for attempt in 1..=MAX_RESTART_ATTEMPTS {
            match handle.restart().await.unwrap_err() {
                McpError::InitFailed { name, .. } => assert_eq!(name, "flaky"),
                other => panic!("expected InitFailed, got {other:?}"),
            }
            assert_eq!(handle.restart_count(), attempt);
        }
        // 10ms + 20ms + 40ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(70));

        match handle.restart().await.unwrap_err() {
            McpError::RestartExhausted { name, attempts } => {
                assert_eq!(name, "flaky");
                assert_eq!(attempts, MAX_RESTART_ATTEMPTS);
            }
            other => panic!("expected RestartExhausted, got {other:?}"),
        }
        assert_eq!(handle.restart_count(), MAX_RESTART_ATTEMPTS);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_unknown_server() {
        let client = McpClient::from_handles(Vec::new());
        let err = client.restart_server("memory").await.unwrap_err();
        assert!(err.to_string().contains("memory"));
    }
}

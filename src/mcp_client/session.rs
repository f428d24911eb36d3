//! Protocol sessions with subprocess-backed tool servers.
//!
//! A session owns the child process and its stdio channel. The process is
//! spawned with `kill_on_drop`, so it is reaped on every exit path even when
//! `shutdown` is never reached.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    InitializeResult, McpToolDefinition, ServerConfig, ServerInfo, ToolCallResult,
    ToolListResult, TransportKind, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the initialize handshake. `uvx` may need to resolve and
/// install the server package on first launch.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between closing stdin and force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on `tools/list` pages followed for one server.
const MAX_DISCOVERY_PAGES: usize = 64;

/// Stderr captured on failure is cut to this many bytes.
const MAX_STDERR_BYTES: usize = 2000;

// ─── ToolServer ──────────────────────────────────────────────────────────────

/// A live session with one tool server.
///
/// Implementations must serialize commands on their channel; callers may
/// invoke concurrently.
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Configured server name.
    fn name(&self) -> &str;

    /// List the tools this server advertises.
    async fn discover_tools(&self) -> Result<Vec<McpToolDefinition>, McpError>;

    /// Invoke a tool by the name the server advertised it under.
    ///
    /// Tool-level failures come back as `Ok` with `success == false`;
    /// `Err` means the call never completed (channel failure, dead process).
    async fn invoke_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError>;

    /// Release the process and channel. Idempotent.
    async fn shutdown(&self);
}

// ─── McpSession ──────────────────────────────────────────────────────────────

/// A running MCP server process with its JSON-RPC transport.
pub struct McpSession {
    name: String,
    transport: StdioTransport,
    process: Mutex<Child>,
    server_info: Option<ServerInfo>,
}

impl McpSession {
    /// Spawn the server process and perform the initialization handshake.
    pub async fn launch(config: &ServerConfig) -> Result<Self, McpError> {
        let name = config.name.as_str();
        match config.transport {
            TransportKind::Stdio => {}
        }

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.envs(&config.env);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{} {}: {e}", config.command, config.args.join(" ")),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        let transport = StdioTransport::new(name, stdin, stdout);

        let server_info = match tokio::time::timeout(INIT_TIMEOUT, handshake(&transport, name))
            .await
        {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = child.start_kill();
                let stderr_ctx = read_stderr_on_failure(stderr).await;
                return Err(McpError::InitFailed {
                    name: name.to_string(),
                    reason: format!("{e}{}", format_stderr_suffix(&stderr_ctx)),
                });
            }
            Err(_) => {
                let _ = child.start_kill();
                let stderr_ctx = read_stderr_on_failure(stderr).await;
                return Err(McpError::InitFailed {
                    name: name.to_string(),
                    reason: format!(
                        "initialization timed out after {}s{}",
                        INIT_TIMEOUT.as_secs(),
                        format_stderr_suffix(&stderr_ctx)
                    ),
                });
            }
        };

        // Keep draining stderr so a chatty server never blocks on a full pipe.
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(name.to_string(), stderr));
        }

        tracing::info!(
            server = name,
            remote_name = server_info.as_ref().and_then(|i| i.name.as_deref()).unwrap_or("-"),
            remote_version = server_info.as_ref().and_then(|i| i.version.as_deref()).unwrap_or("-"),
            "tool server session established"
        );

        Ok(Self {
            name: name.to_string(),
            transport,
            process: Mutex::new(child),
            server_info,
        })
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Check if the server process is still running.
    pub async fn is_alive(&self) -> bool {
        let mut process = self.process.lock().await;
        matches!(process.try_wait(), Ok(None))
    }

    fn crashed(&self, err: McpError) -> McpError {
        if err.is_session_fatal() {
            McpError::ServerCrashed {
                name: self.name.clone(),
                reason: err.to_string(),
            }
        } else {
            err
        }
    }
}

#[async_trait]
impl ToolServer for McpSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_DISCOVERY_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let response = self
                .transport
                .request("tools/list", params)
                .await
                .map_err(|e| self.crashed(e))?;
            let value = extract_result(response).map_err(|e| McpError::DiscoveryFailed {
                server: self.name.clone(),
                reason: e.to_string(),
            })?;
            let page: ToolListResult =
                serde_json::from_value(value).map_err(|e| McpError::DiscoveryFailed {
                    server: self.name.clone(),
                    reason: format!("failed to parse tools/list response: {e}"),
                })?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(server = %self.name, pages = MAX_DISCOVERY_PAGES, "tools/list pagination cut short");
        Ok(tools)
    }

    async fn invoke_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let start = Instant::now();
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });

        let response = self
            .transport
            .request("tools/call", Some(params))
            .await
            .map_err(|e| self.crashed(e))?;
        let elapsed = start.elapsed().as_millis() as u64;

        match extract_result(response) {
            Ok(result) => {
                let is_error = result
                    .get("isError")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let mut outcome = ToolCallResult {
                    tool_name: tool_name.to_string(),
                    server: self.name.clone(),
                    success: !is_error,
                    result: Some(result),
                    error: None,
                    execution_time_ms: elapsed,
                };
                if is_error {
                    outcome.error = Some(outcome.text());
                }
                Ok(outcome)
            }
            Err(McpError::ServerError { code, message, .. }) => Ok(ToolCallResult {
                tool_name: tool_name.to_string(),
                server: self.name.clone(),
                success: false,
                result: None,
                error: Some(format!("[{code}] {message}")),
                execution_time_ms: elapsed,
            }),
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&self) {
        self.transport.close().await;

        let mut process = self.process.lock().await;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, process.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, %status, "tool server exited");
            }
            _ => {
                tracing::warn!(server = %self.name, "tool server did not exit, killing");
                let _ = process.kill().await;
            }
        }
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// `initialize` request followed by the `initialized` notification.
async fn handshake(
    transport: &StdioTransport,
    server_name: &str,
) -> Result<Option<ServerInfo>, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let response = transport.request("initialize", Some(params)).await?;
    let result = extract_result(response)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(version) = &init.protocol_version {
        if version != PROTOCOL_VERSION {
            tracing::debug!(server = server_name, %version, "server negotiated a different protocol version");
        }
    }

    transport.notify("notifications/initialized", None).await?;
    Ok(init.server_info)
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// Read whatever a failed server wrote to stderr, bounded in time and size.
async fn read_stderr_on_failure(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };

    let mut buf = String::new();
    match tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf)).await {
        Ok(Ok(_)) => {
            if buf.len() > MAX_STDERR_BYTES {
                let mut cut = MAX_STDERR_BYTES;
                while !buf.is_char_boundary(cut) {
                    cut -= 1;
                }
                buf.truncate(cut);
                buf.push_str("...(truncated)");
            }
            buf
        }
        _ => String::new(),
    }
}

fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

/// Forward server stderr lines into the log at debug level.
async fn forward_stderr(server: String, stderr: ChildStderr) {
    use tokio::io::AsyncBufReadExt;

    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, "{line}");
    }
}

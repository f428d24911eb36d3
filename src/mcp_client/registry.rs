//! Tool registry — merges tool catalogs from every live session.
//!
//! Provides:
//! - Concurrent discovery across sessions, merged in configuration order
//! - An explicit name-collision policy (reject or namespace)
//! - Routing from an exposed tool name back to its owning session
//! - Structural validation of call arguments against the input schema

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::session::ToolServer;
use super::types::{McpToolDefinition, ToolDescriptor};

/// Separator between server and tool name under [`CollisionPolicy::Namespace`].
///
/// Dots are rejected by some OpenAI-compatible endpoints in function names.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// What to do when two servers advertise the same tool name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Fail registry construction, naming both servers.
    #[default]
    Reject,
    /// Expose every tool as `<server>__<tool>`.
    Namespace,
}

/// A registry entry: the descriptor plus the session that serves it.
#[derive(Clone)]
pub struct RegisteredTool {
    pub descriptor: ToolDescriptor,
    pub session: Arc<dyn ToolServer>,
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Ordered, immutable-after-build mapping of tool name → owning session.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    entries: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
    policy: CollisionPolicy,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("policy", &self.policy)
            .field(
                "tools",
                &self
                    .entries
                    .iter()
                    .map(|e| (&e.descriptor.name, &e.descriptor.server))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            policy,
        }
    }

    /// Discover tools on every session concurrently and merge them.
    ///
    /// Sessions are merged in the order given, so the registry order follows
    /// the server configuration order. The first discovery failure aborts.
    pub async fn aggregate(
        sessions: &[Arc<dyn ToolServer>],
        policy: CollisionPolicy,
    ) -> Result<Self, McpError> {
        let catalogs =
            futures::future::join_all(sessions.iter().map(|s| s.discover_tools())).await;

        let mut registry = Self::new(policy);
        for (session, catalog) in sessions.iter().zip(catalogs) {
            let tools = catalog.map_err(|e| match e {
                McpError::DiscoveryFailed { .. } => e,
                other => McpError::DiscoveryFailed {
                    server: session.name().to_string(),
                    reason: other.to_string(),
                },
            })?;
            tracing::debug!(
                server = session.name(),
                tool_count = tools.len(),
                "discovered tools"
            );
            registry.register_server_tools(Arc::clone(session), tools)?;
        }

        tracing::info!(
            total_tools = registry.len(),
            servers = registry.server_names().len(),
            policy = ?policy,
            "tool registry built"
        );
        Ok(registry)
    }

    /// Register the tools one session advertises.
    pub fn register_server_tools(
        &mut self,
        session: Arc<dyn ToolServer>,
        tools: Vec<McpToolDefinition>,
    ) -> Result<(), McpError> {
        let server = session.name().to_string();
        for tool in tools {
            let exposed = match self.policy {
                CollisionPolicy::Reject => tool.name.clone(),
                CollisionPolicy::Namespace => {
                    format!("{server}{NAMESPACE_SEPARATOR}{}", tool.name)
                }
            };

            if let Some(&existing) = self.index.get(&exposed) {
                return Err(McpError::DuplicateTool {
                    tool: exposed,
                    first: self.entries[existing].descriptor.server.clone(),
                    second: server,
                });
            }

            self.index.insert(exposed.clone(), self.entries.len());
            self.entries.push(RegisteredTool {
                descriptor: ToolDescriptor {
                    name: exposed,
                    remote_name: tool.name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                    server: server.clone(),
                },
                session: Arc::clone(&session),
            });
        }
        Ok(())
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn get_tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.get(name).map(|e| &e.descriptor)
    }

    /// Get the server name that owns a tool.
    pub fn get_server_for_tool(&self, name: &str) -> Option<&str> {
        self.get(name).map(|e| e.descriptor.server.as_str())
    }

    /// All descriptors in registry order.
    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.descriptor.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Server names in order of first appearance.
    pub fn server_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| seen.insert(e.descriptor.server.as_str()))
            .map(|e| e.descriptor.server.clone())
            .collect()
    }

    pub fn tools_for_server(&self, server: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.descriptor.server == server)
            .count()
    }

    /// Keep only tools named in the allowlist.
    pub fn retain_tools(&mut self, allowed: &HashSet<String>) {
        let before = self.entries.len();
        self.entries.retain(|e| allowed.contains(&e.descriptor.name));
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.descriptor.name.clone(), i))
            .collect();
        tracing::info!(
            before,
            after = self.entries.len(),
            "filtered tool registry by enabled_tools allowlist"
        );
    }

    /// Validate a tool call: tool exists and arguments fit the input schema.
    ///
    /// Checks the top level only: object-ness, `required` fields, and the
    /// primitive `type` of declared properties. Deeper validation is left to
    /// the server.
    pub fn validate_tool_call(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), McpError> {
        let def = self.get_tool(name).ok_or_else(|| McpError::UnknownTool {
            name: name.to_string(),
        })?;
        let schema = &def.input_schema;
        let invalid = |reason: String| McpError::InvalidArguments {
            tool: name.to_string(),
            reason,
        };

        let declares_object = schema.get("type").and_then(|t| t.as_str()) == Some("object");
        let args_obj = arguments.as_object();
        if declares_object && args_obj.is_none() {
            return Err(invalid(format!(
                "expected a JSON object, got {}",
                json_type_name(arguments)
            )));
        }

        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for field in required.iter().filter_map(|f| f.as_str()) {
                let present = args_obj.is_some_and(|obj| obj.contains_key(field));
                if !present {
                    return Err(invalid(format!("missing required field: '{field}'")));
                }
            }
        }

        if let (Some(props), Some(obj)) = (
            schema.get("properties").and_then(|p| p.as_object()),
            args_obj,
        ) {
            for (key, value) in obj {
                let Some(expected) = props.get(key).and_then(|p| p.get("type")) else {
                    continue;
                };
                if !matches_declared_type(expected, value) {
                    return Err(invalid(format!(
                        "field '{key}' should be {expected}, got {}",
                        json_type_name(value)
                    )));
                }
            }
        }

        Ok(())
    }

    /// One-paragraph summary of the catalog for the system prompt.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No tools are currently available.".to_string();
        }
        let servers = self.server_names();
        let parts: Vec<String> = servers
            .iter()
            .map(|name| format!("{name} ({})", self.tools_for_server(name)))
            .collect();
        format!(
            "Available capabilities ({} tools across {} servers): {}.",
            self.len(),
            servers.len(),
            parts.join(", ")
        )
    }

    /// Up to `max_results` registered names most similar to `name`.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = self
            .entries
            .iter()
            .map(|e| {
                let candidate = &e.descriptor.name;
                (candidate.clone(), similarity(name, candidate))
            })
            .filter(|(_, score)| *score > 0.3)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name).collect()
    }
}

// ─── Schema helpers ─────────────────────────────────────────────────────────

/// `expected` is a JSON Schema `type`: a string or an array of strings.
fn matches_declared_type(expected: &serde_json::Value, value: &serde_json::Value) -> bool {
    match expected {
        serde_json::Value::String(t) => matches_type(t, value),
        serde_json::Value::Array(types) => types
            .iter()
            .filter_map(|t| t.as_str())
            .any(|t| matches_type(t, value)),
        _ => true,
    }
}

fn matches_type(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Normalized similarity (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

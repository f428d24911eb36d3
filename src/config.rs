//! Agent configuration file (`agent.yaml`).
//!
//! ```yaml
//! servers:
//!   - name: neo4j-cypher
//!     command: uvx
//!     args: [mcp-neo4j-cypher@0.2.4, --transport, stdio]
//!     env:
//!       NEO4J_PASSWORD: ${NEO4J_PASSWORD:-password}
//! default_model: llama3.1
//! default_profile:
//!   base_url: http://localhost:11434/v1
//! models:
//!   gpt-4o-mini:
//!     base_url: https://api.openai.com/v1
//!     api_key_env: OPENAI_API_KEY
//!     supports_usage_accounting: true
//! limits:
//!   max_turns: 10
//! collision_policy: reject
//! enabled_tools: [read_neo4j_cypher, get_neo4j_schema]
//! ```
//!
//! Every section is optional; missing sections take the built-in defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent_core::errors::AgentError;
use crate::agent_core::types::AgentLimits;
use crate::inference::config::{expand_tilde, interpolate_env_vars, ModelsConfig};
use crate::mcp_client::registry::CollisionPolicy;
use crate::mcp_client::types::ServerConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_AGENT_CONFIG";

/// File name searched for upward from the working directory.
pub const CONFIG_FILE_NAME: &str = "agent.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Tool servers, in routing order.
    #[serde(default = "default_servers")]
    pub servers: Vec<ServerConfig>,
    #[serde(flatten)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub limits: AgentLimits,
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
    /// When set, only these tools are exposed to the model.
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            models: ModelsConfig::default(),
            limits: AgentLimits::default(),
            collision_policy: CollisionPolicy::default(),
            enabled_tools: None,
        }
    }
}

/// The Neo4j servers of the reference deployment.
pub fn default_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stdio(
            "neo4j-cypher",
            "uvx",
            &["mcp-neo4j-cypher@0.2.4", "--transport", "stdio"],
        ),
        ServerConfig::stdio(
            "neo4j-data-modeling",
            "uvx",
            &["mcp-neo4j-data-modeling@0.1.1", "--transport", "stdio"],
        ),
        ServerConfig::stdio("memory", "uvx", &["mcp-neo4j-memory@0.1.5"]),
    ]
}

impl AgentConfig {
    /// Parse YAML text after `${VAR}` interpolation, then validate.
    pub fn from_yaml(raw: &str) -> Result<Self, AgentError> {
        let interpolated = interpolate_env_vars(raw);
        let mut config: AgentConfig =
            serde_yaml::from_str(&interpolated).map_err(|e| AgentError::Config {
                reason: format!("failed to parse config: {e}"),
            })?;

        for server in &mut config.servers {
            server.command = expand_tilde(&server.command);
            if let Some(cwd) = server.cwd.as_mut() {
                *cwd = expand_tilde(cwd);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let raw = std::fs::read_to_string(path).map_err(|e| AgentError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config = Self::from_yaml(&raw)?;
        tracing::info!(
            path = %path.display(),
            servers = config.servers.len(),
            models = config.models.models.len(),
            "loaded agent config"
        );
        Ok(config)
    }

    /// Load `explicit` if given, else the discovered config file, else the
    /// built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, AgentError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let start = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        match find_config_path(&start) {
            Some(path) => Self::load(&path),
            None => {
                tracing::info!("no {CONFIG_FILE_NAME} found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(AgentError::Config {
                    reason: "server name must not be empty".into(),
                });
            }
            if server.command.trim().is_empty() {
                return Err(AgentError::Config {
                    reason: format!("server '{}' has an empty command", server.name),
                });
            }
            if !seen.insert(server.name.as_str()) {
                return Err(AgentError::Config {
                    reason: format!("duplicate server name '{}'", server.name),
                });
            }
        }
        if self.limits.max_turns == 0 {
            return Err(AgentError::Config {
                reason: "limits.max_turns must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Locate the config file.
///
/// `MCP_AGENT_CONFIG` wins when it names an existing file; otherwise walks
/// upward from `start` looking for `agent.yaml`.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.is_file() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not name a file, ignoring");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

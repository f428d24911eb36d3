//! Model profiles and config-string interpolation.
//!
//! A profile describes how to reach one model and what it can do. Profiles
//! are resolved once per model identifier, when its agent session is built.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::errors::InferenceError;

/// Ollama's OpenAI-compatible endpoint.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

/// Model used when the caller does not name one.
pub const DEFAULT_MODEL: &str = "llama3.1";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Endpoint and capabilities for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name sent on the wire; defaults to the model identifier.
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Environment variable holding a bearer token, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// The endpoint reports `usage` and callers want it summed per request.
    #[serde(default)]
    pub supports_usage_accounting: bool,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model_name: None,
            temperature: 0.0,
            max_tokens: None,
            api_key_env: None,
            supports_usage_accounting: false,
        }
    }
}

impl ModelProfile {
    /// Read the bearer token from `api_key_env`, if configured and set.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }
}

/// A profile bound to the identifier it was resolved for.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    /// Identifier the caller asked for (the cache key).
    pub id: String,
    /// Name sent in the request body.
    pub wire_name: String,
    pub profile: ModelProfile,
}

/// The `models` section of the agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Applied to identifiers without an explicit entry in `models`.
    #[serde(default)]
    pub default_profile: ModelProfile,
    #[serde(default)]
    pub models: HashMap<String, ModelProfile>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            default_profile: ModelProfile::default(),
            models: HashMap::new(),
        }
    }
}

impl ModelsConfig {
    /// Resolve the profile for a model identifier.
    ///
    /// An empty identifier selects `default_model`. Identifiers without an
    /// entry fall back to `default_profile`.
    pub fn resolve(&self, model_id: &str) -> Result<ResolvedModel, InferenceError> {
        let id = match model_id.trim() {
            "" => self.default_model.trim(),
            other => other,
        };
        if id.is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "no model identifier given and no default_model configured".into(),
            });
        }

        let profile = self
            .models
            .get(id)
            .cloned()
            .unwrap_or_else(|| self.default_profile.clone());
        let wire_name = profile.model_name.clone().unwrap_or_else(|| id.to_string());

        Ok(ResolvedModel {
            id: id.to_string(),
            wire_name,
            profile,
        })
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            let resolved = resolve_var_expr(&var_expr);
            result.push_str(&resolved);
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

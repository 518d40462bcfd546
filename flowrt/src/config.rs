//! Runtime configuration
//!
//! Loaded from a TOML file and then overridden from the environment.

use flowlang::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the runtime and its providers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Provider used when no model route matches
    pub default_provider: Option<String>,
    /// Model used when an agent does not declare one
    pub default_model: String,
    /// Per-execution deadline when the caller does not pass one
    pub timeout_seconds: u64,
    /// Upper bound on model calls in one intent tool loop
    pub max_tool_turns: usize,
    /// Report a failure instead of returning partial output when the turn cap is hit
    pub fail_on_turn_cap: bool,
    /// Trigger engine poll interval
    pub trigger_tick_secs: u64,
    /// Send the MCP `initialize` handshake after spawning a server
    pub mcp_handshake: bool,
    /// Model-name prefix to provider-name table, checked in order
    pub model_routes: Vec<ModelRoute>,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRoute {
    pub prefix: String,
    pub provider: String,
}

impl ModelRoute {
    pub fn new(prefix: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            provider: provider.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai: Option<HttpProviderConfig>,
    pub anthropic: Option<HttpProviderConfig>,
}

/// Settings shared by the HTTP-backed providers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProviderConfig {
    /// Inline API key; prefer `api_key_env`
    pub api_key: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    pub timeout_seconds: Option<u64>,
}

impl HttpProviderConfig {
    /// Inline key, then the configured variable, then the provider's conventional variable.
    pub fn resolve_api_key(&self, default_env: &str) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        let var = self.api_key_env.as_deref().unwrap_or(default_env);
        std::env::var(var).ok().filter(|k| !k.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(60))
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            default_model: "gpt-4o-mini".to_string(),
            timeout_seconds: 300,
            max_tool_turns: 10,
            fail_on_turn_cap: false,
            trigger_tick_secs: 60,
            mcp_handshake: true,
            model_routes: vec![
                ModelRoute::new("gpt-", "openai"),
                ModelRoute::new("o1", "openai"),
                ModelRoute::new("o3", "openai"),
                ModelRoute::new("claude", "anthropic"),
            ],
            providers: ProvidersConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RuntimeError::Io(format!(
                "Failed to read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> RuntimeResult<Self> {
        toml::from_str(content)
            .map_err(|e| RuntimeError::Serialization(format!("Invalid config: {}", e)))
    }

    /// Apply `FLOWRT_*` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(provider) = std::env::var("FLOWRT_DEFAULT_PROVIDER") {
            self.default_provider = Some(provider);
        }
        if let Ok(model) = std::env::var("FLOWRT_DEFAULT_MODEL") {
            self.default_model = model;
        }
        if let Some(secs) = env_parse("FLOWRT_TIMEOUT_SECS") {
            self.timeout_seconds = secs;
        }
        if let Some(turns) = env_parse("FLOWRT_MAX_TOOL_TURNS") {
            self.max_tool_turns = turns;
        }
        if let Ok(flag) = std::env::var("FLOWRT_FAIL_ON_TURN_CAP") {
            self.fail_on_turn_cap = flag == "1" || flag == "true";
        }
        self
    }

    /// Provider name for a model id according to the prefix table.
    pub fn route_for(&self, model: &str) -> Option<&str> {
        self.model_routes
            .iter()
            .find(|route| model.starts_with(&route.prefix))
            .map(|route| route.provider.as_str())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn trigger_tick(&self) -> Duration {
        Duration::from_secs(self.trigger_tick_secs.max(1))
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_route_known_prefixes() {
        let config = RuntimeConfig::default();
        assert_eq!(config.route_for("gpt-4o"), Some("openai"));
        assert_eq!(config.route_for("claude-3-5-sonnet"), Some("anthropic"));
        assert_eq!(config.route_for("llama3"), None);
        assert_eq!(config.max_tool_turns, 10);
    }

    #[test]
    fn parses_partial_toml() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            default_provider = "anthropic"
            max_tool_turns = 4

            [[model_routes]]
            prefix = "llama"
            provider = "local"

            [providers.openai]
            api_key_env = "MY_OPENAI_KEY"
            base_url = "http://localhost:8080/v1"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_provider.as_deref(), Some("anthropic"));
        assert_eq!(config.max_tool_turns, 4);
        assert_eq!(config.timeout_seconds, 300);
        assert_eq!(config.route_for("llama3"), Some("local"));
        assert_eq!(config.route_for("gpt-4o"), None);
        let openai = config.providers.openai.unwrap();
        assert_eq!(openai.base_url.as_deref(), Some("http://localhost:8080/v1"));
    }

    #[test]
    fn inline_key_wins_over_environment() {
        let settings = HttpProviderConfig {
            api_key: Some("inline".into()),
            ..Default::default()
        };
        assert_eq!(
            settings.resolve_api_key("FLOWRT_TEST_UNSET_KEY").as_deref(),
            Some("inline")
        );
        let empty = HttpProviderConfig::default();
        assert_eq!(empty.resolve_api_key("FLOWRT_TEST_UNSET_KEY"), None);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("max_tool_turns = \"many\""),
            Err(RuntimeError::Serialization(_))
        ));
    }
}

//! Layered configuration: built-in defaults, an optional TOML file, then
//! environment variables.

use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Workflow engine tuning
    pub engine: EngineConfig,
    /// HTTP server settings
    pub server: ServerConfig,
    /// LLM provider settings
    pub provider: ProviderConfig,
}

/// Workflow engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long the publisher waits on the stream bridge before re-checking cancellation
    pub poll_interval_ms: u64,
    /// Upper bound on stage executors running at once
    pub max_concurrent_stages: usize,
    /// Wall-clock limit for one stage run; unset means no limit
    pub stage_timeout_secs: Option<u64>,
    /// Per-workflow subscriber buffer
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_concurrent_stages: 4,
            stage_timeout_secs: None,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Bridge poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Stage timeout, if configured
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to bind
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8000".to_string(),
        }
    }
}

/// LLM provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// OpenAI-compatible API base URL
    pub base_url: String,
    /// Chat model
    pub model: String,
    /// API key; never written back out
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Completion token cap
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_seconds: 300,
            temperature: None,
            max_tokens: 8000,
        }
    }
}

impl AppConfig {
    /// Default location: `<config dir>/deal-copilot/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut dir| {
            dir.push("deal-copilot");
            dir.push("config.toml");
            dir
        })
    }

    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one the default path is tried
    /// and silently ignored when absent. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        info!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    /// Parse TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Apply `DEAL_*` and `OPENAI_API_KEY` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DEAL_POLL_INTERVAL_MS") {
            self.engine.poll_interval_ms = parse_var("DEAL_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("DEAL_MAX_CONCURRENT_STAGES") {
            self.engine.max_concurrent_stages = parse_var("DEAL_MAX_CONCURRENT_STAGES", &v)?;
        }
        if let Some(v) = lookup("DEAL_STAGE_TIMEOUT_SECS") {
            self.engine.stage_timeout_secs = Some(parse_var("DEAL_STAGE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("DEAL_LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Some(v) = lookup("DEAL_OPENAI_BASE_URL") {
            self.provider.base_url = v;
        }
        if let Some(v) = lookup("DEAL_OPENAI_MODEL") {
            self.provider.model = v;
        }
        if let Some(v) = lookup("OPENAI_API_KEY") {
            if !v.trim().is_empty() {
                self.provider.api_key = Some(v);
            }
        }
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.poll_interval_ms == 0 {
            return Err(EngineError::Config(
                "engine.poll_interval_ms must be positive".into(),
            ));
        }
        if self.engine.max_concurrent_stages == 0 {
            return Err(EngineError::Config(
                "engine.max_concurrent_stages must be at least 1".into(),
            ));
        }
        if self.engine.event_capacity == 0 {
            return Err(EngineError::Config(
                "engine.event_capacity must be at least 1".into(),
            ));
        }
        if self.engine.stage_timeout_secs == Some(0) {
            return Err(EngineError::Config(
                "engine.stage_timeout_secs must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{key} has invalid value '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.engine.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.engine.max_concurrent_stages, 4);
        assert_eq!(config.engine.stage_timeout(), None);
        assert_eq!(config.server.listen_addr, "127.0.0.1:8000");
        assert_eq!(config.provider.model, "gpt-4o-mini");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [engine]
            max_concurrent_stages = 2

            [provider]
            model = "gpt-4o"
            "#,
        )
        .expect("parse");
        assert_eq!(config.engine.max_concurrent_stages, 2);
        assert_eq!(config.engine.poll_interval_ms, 100);
        assert_eq!(config.provider.model, "gpt-4o");
        assert_eq!(config.provider.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DEAL_STAGE_TIMEOUT_SECS", "30"),
            ("DEAL_LISTEN_ADDR", "0.0.0.0:9000"),
            ("OPENAI_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(config.engine.stage_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|k| (k == "DEAL_MAX_CONCURRENT_STAGES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = AppConfig::default();
        config.engine.max_concurrent_stages = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.toml");
        assert!(AppConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_api_key_not_serialized() {
        let mut config = AppConfig::default();
        config.provider.api_key = Some("sk-secret".into());
        let text = toml::to_string(&config).expect("serialize");
        assert!(!text.contains("sk-secret"));
    }
}

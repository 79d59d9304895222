//! Configuration file loader.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error type for configuration loading.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// CLI invocation settings.
    pub cli: CliConfig,
    /// Per-session message queue capacity.
    pub queue_cap: usize,
    /// Answer ask-user prompts automatically with the first option.
    pub auto_accept: bool,
    /// Timeout settings.
    pub timeouts: TimeoutConfig,
    /// Rate-limit settings.
    pub rate_limit: RateLimitConfig,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            cli: CliConfig::default(),
            queue_cap: 10,
            auto_accept: false,
            timeouts: TimeoutConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// CLI invocation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Binary or script to execute.
    pub binary: String,
    /// Default model selection.
    pub model: Option<String>,
    /// Default working directory.
    pub working_dir: Option<PathBuf>,
    /// Default system prompt override.
    pub system_prompt: Option<String>,
    /// Default turn cap per prompt.
    pub max_turns: Option<u32>,
    /// Tools the CLI is allowed to use.
    pub allowed_tools: Vec<String>,
    /// Tools the CLI must not use.
    pub disallowed_tools: Vec<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: None,
            working_dir: None,
            system_prompt: None,
            max_turns: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
        }
    }
}

/// Timeout configuration, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection liveness probe.
    pub probe_secs: u64,
    /// Whole-turn bound; tool use can be slow.
    pub turn_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_secs: 5,
            turn_secs: 300,
        }
    }
}

impl TimeoutConfig {
    /// The whole-turn timeout as a `Duration`.
    #[must_use]
    pub fn turn(&self) -> Duration {
        Duration::from_secs(self.turn_secs)
    }

    /// The probe timeout as a `Duration`.
    #[must_use]
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }
}

/// Rate-limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Countdown used when no retry-after hint can be parsed.
    pub default_retry_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_retry_secs: 60,
        }
    }
}

impl ConductorConfig {
    /// Default config file path under the user config directory.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("claude-conductor")
            .join("config.toml")
    }

    /// Load configuration from a TOML file. A missing file yields the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` on read failure or malformed TOML.
    pub async fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::debug!(path = ?path, "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = tokio::fs::read_to_string(path).await?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = ConductorConfig::default();
        assert_eq!(config.cli.binary, "claude");
        assert_eq!(config.queue_cap, 10);
        assert!(!config.auto_accept);
        assert_eq!(config.timeouts.turn(), Duration::from_secs(300));
        assert_eq!(config.rate_limit.default_retry_secs, 60);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ConductorConfig = toml::from_str(
            r#"
            auto_accept = true

            [cli]
            binary = "claude-dev"
            model = "claude-sonnet"

            [timeouts]
            turn_secs = 600
            "#,
        )
        .unwrap();
        assert!(config.auto_accept);
        assert_eq!(config.cli.binary, "claude-dev");
        assert_eq!(config.cli.model.as_deref(), Some("claude-sonnet"));
        assert_eq!(config.timeouts.turn_secs, 600);
        assert_eq!(config.timeouts.probe_secs, 5);
        assert_eq!(config.queue_cap, 10);
    }
}

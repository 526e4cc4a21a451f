use std::path::{Path, PathBuf};

use kfob_core::TokenPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Where the token record lives between runs
    pub state_path: PathBuf,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,

    pub policy: TokenPolicy,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("kfob-token.json"),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            policy: TokenPolicy::default(),
        }
    }
}

impl SimConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;

        let config: SimConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an environment-like lookup. `RUST_LOG` wins over
    /// `KFOB_LOG_LEVEL`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("KFOB_STATE_PATH") {
            config.state_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("KFOB_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(flag) = lookup("KFOB_REQUIRE_PIN") {
            config.policy.require_pin = parse_flag("KFOB_REQUIRE_PIN", &flag)?;
        }
        if let Some(limit) = lookup("KFOB_PIN_TRY_LIMIT") {
            config.policy.pin_try_limit = limit.trim().parse::<u8>().map_err(|e| {
                ConfigError::ParseError(format!("KFOB_PIN_TRY_LIMIT={}: {}", limit, e))
            })?;
        }
        if let Some(level) = lookup("RUST_LOG") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "state_path must not be empty".to_string(),
            ));
        }
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "log_level must not be empty".to_string(),
            ));
        }
        self.policy
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::ParseError(format!("{}={}", name, other))),
    }
}

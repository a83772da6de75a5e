//! Configuration loading, validation, and management for Coxswain.
//!
//! Loads configuration from `~/.coxswain/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// The root configuration structure.
///
/// Maps directly to `~/.coxswain/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Provider connection settings.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Overrides the provider's model context window, in tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,

    /// Skip the approval gate for read-only tools.
    #[serde(default)]
    pub always_allow_read_only: bool,

    /// Extra instructions appended to the system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,

    /// Working directory the file/command tools are rooted at.
    /// Defaults to the process working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,

    /// Where task checkpoints are stored. Defaults to `~/.coxswain/tasks`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_dir: Option<PathBuf>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API key. Overridable via `COXSWAIN_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// API base URL override (testing, proxies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            base_url: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            context_window: None,
            always_allow_read_only: false,
            custom_instructions: None,
            workdir: None,
            tasks_dir: None,
        }
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("provider.api_key", &redact(&self.provider.api_key))
            .field("provider.model", &self.provider.model)
            .field("provider.base_url", &self.provider.base_url)
            .field("context_window", &self.context_window)
            .field("always_allow_read_only", &self.always_allow_read_only)
            .field("custom_instructions", &self.custom_instructions)
            .field("workdir", &self.workdir)
            .field("tasks_dir", &self.tasks_dir)
            .finish()
    }
}

impl AppConfig {
    /// Default config file path: `~/.coxswain/config.toml`.
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".coxswain").join("config.toml")
    }

    /// Load from the default path; a missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path())
    }

    /// Load from an explicit path; a missing file yields defaults.
    /// Environment overrides are applied in both cases.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let parsed: AppConfig = toml::from_str(&content)?;
            debug!(path = %path.display(), "Configuration loaded");
            parsed
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("COXSWAIN_API_KEY") {
            if !key.is_empty() {
                self.provider.api_key = Some(key);
            }
        }
        if let Ok(model) = std::env::var("COXSWAIN_MODEL") {
            if !model.is_empty() {
                self.provider.model = model;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.model.trim().is_empty() {
            return Err(ConfigError::Invalid("provider.model is empty".into()));
        }
        if let Some(window) = self.context_window {
            if window < 10_000 {
                return Err(ConfigError::Invalid(format!(
                    "context_window {window} is too small (minimum 10000)"
                )));
            }
        }
        Ok(())
    }

    /// Effective working directory for tools.
    pub fn effective_workdir(&self) -> PathBuf {
        self.workdir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

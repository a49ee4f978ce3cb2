//! Configuration for the adapter.
//!
//! Settings come from a JSON document: the file named by `--config`, or
//! else the `REPLINK_CONFIG` environment variable. Every field has a
//! default, so running with neither is fine.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::transport::DEFAULT_BUFFER_CAPACITY;

/// Environment variable holding inline JSON configuration.
pub const CONFIG_ENV: &str = "REPLINK_CONFIG";

/// Environment variable overriding the initial body buffer capacity.
pub const BUFFER_CAPACITY_ENV: &str = "REPLINK_BUFFER_CAPACITY";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// Protocol session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Body buffer bytes allocated up front.
    #[serde(default = "default_buffer_capacity")]
    pub initial_buffer_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_buffer_capacity: default_buffer_capacity(),
        }
    }
}

/// Embedded interpreter settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Strip file, process and module loading functions.
    #[serde(default)]
    pub sandbox: bool,

    /// Cap on interpreter heap usage.
    #[serde(default)]
    pub memory_limit_bytes: Option<usize>,
}

impl Config {
    /// Load configuration from `path`, else from `REPLINK_CONFIG`, else
    /// defaults; then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var(CONFIG_ENV) {
                Ok(json) => Self::from_json(&json)
                    .with_context(|| format!("Failed to parse {CONFIG_ENV}"))?,
                Err(_) => {
                    debug!("No configuration given, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid configuration JSON")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(BUFFER_CAPACITY_ENV) {
            match value.parse() {
                Ok(capacity) => self.session.initial_buffer_capacity = capacity,
                Err(e) => {
                    warn!(value = %value, error = %e, "Ignoring invalid {BUFFER_CAPACITY_ENV}");
                }
            }
        }
    }
}

const fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

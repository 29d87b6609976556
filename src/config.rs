//! Configuration file support for procrack.
//!
//! A `procrack.toml` next to the Procfile can supply defaults for every
//! `start` option. Command-line flags always win over values from the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Name of the configuration file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "procrack.toml";

/// Top-level structure of `procrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path to the Procfile.
    pub procfile: Option<String>,
    /// Path to the environment file.
    pub env: Option<String>,
    /// Base port handed out to the first template.
    pub port: Option<u16>,
    /// Replica counts, in `name=count,...` form.
    pub concurrency: Option<String>,
    /// Relaunch processes that exit on their own.
    pub restart: Option<bool>,
    /// Pause before relaunching an exited process (ms).
    pub restart_delay_ms: Option<u64>,
    /// Time between SIGTERM and SIGKILL during shutdown (ms).
    pub shutdown_grace_ms: Option<u64>,
    /// Prefix output lines with the elapsed run time.
    pub timestamp: Option<bool>,
    /// Colorize labels; unset means "when stdout is a terminal".
    pub color: Option<bool>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Returns `./procrack.toml` if it exists.
pub fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(DEFAULT_CONFIG_FILE);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

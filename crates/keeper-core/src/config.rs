//! Configuration management for keeper

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Global keeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Driver used when the caller does not name one
    #[serde(default = "default_driver")]
    pub default_driver: String,

    /// Upper bound for a single driver subprocess (seconds)
    #[serde(default = "default_driver_timeout_secs")]
    pub driver_timeout_secs: u64,

    /// Largest secret payload accepted (bytes)
    #[serde(default = "default_max_secret_size")]
    pub max_secret_size: usize,

    /// Binary invoked by the pass driver
    #[serde(default = "default_gpg_binary")]
    pub gpg_binary: String,

    /// Shell used to run shell driver templates
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_driver: default_driver(),
            driver_timeout_secs: default_driver_timeout_secs(),
            max_secret_size: default_max_secret_size(),
            gpg_binary: default_gpg_binary(),
            shell: default_shell(),
        }
    }
}

fn default_driver() -> String {
    "file".to_string()
}

fn default_driver_timeout_secs() -> u64 {
    30
}

fn default_max_secret_size() -> usize {
    512_000
}

fn default_gpg_binary() -> String {
    "gpg".to_string()
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl Config {
    /// Load config from file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Driver subprocess timeout as a Duration
    pub fn driver_timeout(&self) -> Duration {
        Duration::from_secs(self.driver_timeout_secs)
    }
}

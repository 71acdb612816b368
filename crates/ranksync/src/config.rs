use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::engine::RollbackPolicy;

/// Environment variable naming a YAML config file
pub const CONFIG_ENV_VAR: &str = "RANKSYNC_CONFIG";

/// Engine and session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub search: SearchConfig,
    pub rollback: RollbackPolicy,
    /// Capacity of the notification and event broadcast channels
    pub error_channel_capacity: usize,
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            search: SearchConfig::default(),
            rollback: RollbackPolicy::default(),
            error_channel_capacity: 64,
            log_filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Minimum similarity (0.0..=1.0) for a search hit
    pub threshold: f64,
    /// Queries shorter than this (after trimming) show the unfiltered view
    pub min_query_len: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            min_query_len: 1,
        }
    }
}

impl EngineConfig {
    /// Load settings from a YAML file; absent keys keep their defaults
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
        })?;

        let config: EngineConfig = serde_yaml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse config YAML {}: {}", path.display(), e)
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `RANKSYNC_CONFIG`, or use defaults
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load_from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.search.threshold) {
            anyhow::bail!(
                "search.threshold must be within 0.0..=1.0, got {}",
                self.search.threshold
            );
        }
        if self.error_channel_capacity == 0 {
            anyhow::bail!("error_channel_capacity must be greater than zero");
        }
        Ok(())
    }
}

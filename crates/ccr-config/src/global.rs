//! Global Configuration (~/.ccr/config.toml)

use crate::project::{validate_path, validate_workers};
use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global user configuration from ~/.ccr/config.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaults: Option<DefaultsConfig>,
}

/// Fallbacks used when a project leaves a setting unset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct DefaultsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl GlobalConfig {
    /// Load global configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let config: Self = crate::read_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(defaults) = &self.defaults {
            validate_workers("defaults.workers", defaults.workers)?;
            validate_path("defaults.cache_dir", defaults.cache_dir.as_deref())?;
        }
        Ok(())
    }

    /// Path of the global configuration file (~/.ccr/config.toml)
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".ccr").join("config.toml"))
    }

    pub fn default_workers(&self) -> Option<usize> {
        self.defaults.as_ref()?.workers
    }

    pub fn default_cache_dir(&self) -> Option<&Path> {
        self.defaults.as_ref()?.cache_dir.as_deref()
    }
}

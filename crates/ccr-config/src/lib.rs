//! CCR Configuration System
//!
//! Layered settings for the `ccr` tool:
//! - Project configuration (ccr.toml, found by walking up from the working directory)
//! - Global user configuration (~/.ccr/config.toml)
//! - Environment overrides (CCR_*)
//!
//! # Configuration Hierarchy
//!
//! Later sources override earlier ones:
//! 1. Global config (~/.ccr/config.toml)
//! 2. Project config (./ccr.toml)
//! 3. Environment variables (CCR_CACHE_DIR, CCR_WORKERS, CCR_CONTRACTS_DIR, CCR_BASE_DIR)
//! 4. CLI flags (applied by the caller)
//!
//! # Example
//!
//! ```no_run
//! use ccr_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("{} workers", config.workers());
//! ```

pub mod global;
pub mod loader;
pub mod project;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Reads a TOML file, mapping a missing file to [`ConfigError::NotFound`].
pub(crate) fn read_toml<T: serde::de::DeserializeOwned>(
    path: &std::path::Path,
) -> ConfigResult<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(path.to_path_buf())
        } else {
            ConfigError::IoError(e)
        }
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
        file: path.to_path_buf(),
        error: e,
    })
}

pub use global::GlobalConfig;
pub use loader::{Config, ConfigLoader};
pub use project::ProjectConfig;

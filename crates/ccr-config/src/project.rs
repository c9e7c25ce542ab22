//! Project Configuration (ccr.toml)
//!
//! Handles project-level configuration stored in `ccr.toml` at the project root.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the project configuration file.
pub const PROJECT_FILE: &str = "ccr.toml";

/// Project configuration from ccr.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Definition tree and output locations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<PathsConfig>,

    /// Build output cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,

    /// Build scheduling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Root of the definition tree (`<contracts>/a/b.toml` is package `//a/b`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contracts: Option<PathBuf>,

    /// Default base directory that targets are generated into and checked against
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Entries older than this are removed by `clean-cache`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_hours: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Parallel build workers per phase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

impl ProjectConfig {
    /// Load project configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let config: Self = crate::read_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the project configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(paths) = &self.paths {
            validate_path("paths.contracts", paths.contracts.as_deref())?;
            validate_path("paths.base", paths.base.as_deref())?;
        }
        if let Some(cache) = &self.cache {
            validate_path("cache.dir", cache.dir.as_deref())?;
        }
        if let Some(build) = &self.build {
            validate_workers("build.workers", build.workers)?;
        }
        Ok(())
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::invalid("project", e.to_string()))
    }

    pub fn contracts_dir(&self) -> Option<&Path> {
        self.paths.as_ref()?.contracts.as_deref()
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.paths.as_ref()?.base.as_deref()
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache.as_ref()?.dir.as_deref()
    }

    pub fn cache_max_age_hours(&self) -> Option<u64> {
        self.cache.as_ref()?.max_age_hours
    }

    pub fn workers(&self) -> Option<usize> {
        self.build.as_ref()?.workers
    }

    pub(crate) fn paths_mut(&mut self) -> &mut PathsConfig {
        self.paths.get_or_insert_with(Default::default)
    }

    pub(crate) fn cache_mut(&mut self) -> &mut CacheConfig {
        self.cache.get_or_insert_with(Default::default)
    }

    pub(crate) fn build_mut(&mut self) -> &mut BuildConfig {
        self.build.get_or_insert_with(Default::default)
    }
}

pub(crate) fn validate_path(field: &str, path: Option<&Path>) -> ConfigResult<()> {
    match path {
        Some(p) if p.as_os_str().is_empty() => Err(ConfigError::invalid(field, "path cannot be empty")),
        _ => Ok(()),
    }
}

pub(crate) fn validate_workers(field: &str, workers: Option<usize>) -> ConfigResult<()> {
    match workers {
        Some(0) => Err(ConfigError::invalid(field, "must be at least 1")),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full_config() {
        let config: ProjectConfig = toml::from_str(
            r#"
[paths]
contracts = "contracts"
base = "out"

[cache]
dir = "/var/cache/ccr"
max_age_hours = 96

[build]
workers = 3
"#,
        )
        .unwrap();

        assert_eq!(config.contracts_dir(), Some(Path::new("contracts")));
        assert_eq!(config.base_dir(), Some(Path::new("out")));
        assert_eq!(config.cache_dir(), Some(Path::new("/var/cache/ccr")));
        assert_eq!(config.cache_max_age_hours(), Some(96));
        assert_eq!(config.workers(), Some(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config: ProjectConfig = toml::from_str("").unwrap();
        assert_eq!(config, ProjectConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config: ProjectConfig = toml::from_str("[build]\nworkers = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for 'build.workers': must be at least 1"
        );
    }

    #[test]
    fn test_empty_path_rejected() {
        let config: ProjectConfig = toml::from_str("[paths]\ncontracts = \"\"\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "paths.contracts"
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<ProjectConfig>("[build]\nthreads = 2\n").is_err());
    }

    #[test]
    fn test_serialize_skips_unset_sections() {
        let mut config = ProjectConfig::default();
        config.build_mut().workers = Some(2);
        assert_eq!(config.to_toml_string().unwrap(), "[build]\nworkers = 2\n");
    }
}

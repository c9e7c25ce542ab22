//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::global::GlobalConfig;
use crate::project::{self, ProjectConfig, PROJECT_FILE};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parallel build workers when nothing else says otherwise.
pub const DEFAULT_WORKERS: usize = 3;

/// Default cache clean horizon: four days.
pub const DEFAULT_MAX_AGE_HOURS: u64 = 96;

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.ccr/config.toml) - lowest priority
/// 2. Project config (./ccr.toml) - overrides global
/// 3. Environment variables (CCR_*) - overrides project
/// 4. CLI flags - highest priority (handled by caller)
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone)]
pub struct Config {
    /// Project configuration, with environment overrides applied
    pub project: ProjectConfig,

    /// Global configuration
    pub global: GlobalConfig,

    /// Project root directory (where ccr.toml was found)
    pub project_root: Option<PathBuf>,

    /// Directory the search started from
    pub work_dir: PathBuf,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use `path` instead of ~/.ccr/config.toml for the global layer.
    pub fn with_global_config(path: impl Into<PathBuf>) -> Self {
        Self {
            global_config_path: Some(path.into()),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find ccr.toml, then loads and merges
    /// global config if it exists.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;
        self.finish(project_config, project_root, start_dir)
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project_config = ProjectConfig::load_from_file(config_path)?;
        let project_root = config_path.parent().map(|p| p.to_path_buf());
        let work_dir = project_root.clone().unwrap_or_default();
        self.finish(project_config, project_root, &work_dir)
    }

    fn finish(
        &mut self,
        project: ProjectConfig,
        project_root: Option<PathBuf>,
        work_dir: &Path,
    ) -> ConfigResult<Config> {
        let global = self.load_global_config()?;
        let project = apply_env_overrides(project, work_dir)?;
        project.validate()?;
        Ok(Config {
            project,
            global,
            project_root,
            work_dir: work_dir.to_path_buf(),
        })
    }

    /// Find project configuration by walking up directory tree
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, ProjectConfig)> {
        for dir in start_dir.ancestors() {
            let config_path = dir.join(PROJECT_FILE);
            if config_path.is_file() {
                let project_config = ProjectConfig::load_from_file(&config_path)?;
                return Ok((Some(dir.to_path_buf()), project_config));
            }
        }
        Ok((None, ProjectConfig::default()))
    }

    /// Load global configuration, defaulting when the file is absent.
    ///
    /// A missing home directory also yields the default; a global file that
    /// exists but does not parse is an error.
    fn load_global_config(&mut self) -> ConfigResult<GlobalConfig> {
        if self.global_config_path.is_none() {
            match GlobalConfig::global_config_path() {
                Ok(p) => self.global_config_path = Some(p),
                Err(ConfigError::HomeNotFound) => return Ok(GlobalConfig::default()),
                Err(e) => return Err(e),
            }
        }

        match &self.global_config_path {
            Some(path) if path.exists() => GlobalConfig::load_from_file(path),
            _ => Ok(GlobalConfig::default()),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply CCR_* environment variables on top of the project config.
///
/// Relative paths from the environment are taken against `work_dir`.
fn apply_env_overrides(mut config: ProjectConfig, work_dir: &Path) -> ConfigResult<ProjectConfig> {
    let env_path = |name: &str| env::var_os(name).map(|v| work_dir.join(PathBuf::from(v)));

    if let Some(dir) = env_path("CCR_CACHE_DIR") {
        config.cache_mut().dir = Some(dir);
    }
    if let Some(dir) = env_path("CCR_CONTRACTS_DIR") {
        config.paths_mut().contracts = Some(dir);
    }
    if let Some(dir) = env_path("CCR_BASE_DIR") {
        config.paths_mut().base = Some(dir);
    }
    if let Ok(workers) = env::var("CCR_WORKERS") {
        let parsed = workers
            .trim()
            .parse::<usize>()
            .map_err(|e| ConfigError::invalid("CCR_WORKERS", format!("'{}': {}", workers, e)))?;
        project::validate_workers("CCR_WORKERS", Some(parsed))?;
        config.build_mut().workers = Some(parsed);
    }

    Ok(config)
}

impl Config {
    /// Directory relative project paths are taken against.
    fn anchor(&self) -> &Path {
        self.project_root.as_deref().unwrap_or(&self.work_dir)
    }

    /// Root of the definition tree (project > project root or working directory)
    pub fn contracts_dir(&self) -> PathBuf {
        match self.project.contracts_dir() {
            Some(p) => self.anchor().join(p),
            None => self.anchor().to_path_buf(),
        }
    }

    /// Base directory targets are checked against and generated into
    /// (project > working directory)
    pub fn base_dir(&self) -> PathBuf {
        match self.project.base_dir() {
            Some(p) => self.anchor().join(p),
            None => self.work_dir.clone(),
        }
    }

    /// Cache directory (project > global > platform cache dir + "/ccr")
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(p) = self.project.cache_dir() {
            return self.anchor().join(p);
        }
        if let Some(p) = self.global.default_cache_dir() {
            return p.to_path_buf();
        }
        dirs::cache_dir()
            .unwrap_or_else(env::temp_dir)
            .join("ccr")
    }

    /// Parallel build workers (project > global > default)
    pub fn workers(&self) -> usize {
        self.project
            .workers()
            .or_else(|| self.global.default_workers())
            .unwrap_or(DEFAULT_WORKERS)
    }

    pub fn cache_max_age(&self) -> Duration {
        let hours = self
            .project
            .cache_max_age_hours()
            .unwrap_or(DEFAULT_MAX_AGE_HOURS);
        Duration::from_secs(hours * 3600)
    }

    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if this is a project (has ccr.toml)
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn create_config_file(dir: &Path, content: &str) -> PathBuf {
        let config_path = dir.join(PROJECT_FILE);
        fs::write(&config_path, content).unwrap();
        config_path
    }

    fn loader(dir: &TempDir) -> ConfigLoader {
        ConfigLoader::with_global_config(dir.path().join("no-global.toml"))
    }

    #[test]
    #[serial]
    fn test_relative_paths_follow_project_root() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            "[paths]\ncontracts = \"defs\"\nbase = \"out\"\n",
        );
        let sub_dir = temp_dir.path().join("nested");
        fs::create_dir(&sub_dir).unwrap();

        let config = loader(&temp_dir).load_from_directory(&sub_dir).unwrap();

        assert_eq!(config.contracts_dir(), temp_dir.path().join("defs"));
        assert_eq!(config.base_dir(), temp_dir.path().join("out"));
    }

    #[test]
    #[serial]
    fn test_defaults_without_project() {
        let temp_dir = TempDir::new().unwrap();
        let config = loader(&temp_dir).load_from_directory(temp_dir.path()).unwrap();

        assert!(!config.is_project());
        assert_eq!(config.contracts_dir(), temp_dir.path());
        assert_eq!(config.base_dir(), temp_dir.path());
        assert_eq!(config.workers(), DEFAULT_WORKERS);
        assert_eq!(config.cache_max_age(), Duration::from_secs(96 * 3600));
    }

    #[test]
    #[serial]
    fn test_env_workers_override() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(temp_dir.path(), "[build]\nworkers = 2\n");

        env::set_var("CCR_WORKERS", "6");
        let config = loader(&temp_dir).load_from_directory(temp_dir.path());
        env::remove_var("CCR_WORKERS");

        assert_eq!(config.unwrap().workers(), 6);
    }

    #[test]
    #[serial]
    fn test_env_workers_must_be_positive() {
        let temp_dir = TempDir::new().unwrap();

        env::set_var("CCR_WORKERS", "0");
        let result = loader(&temp_dir).load_from_directory(temp_dir.path());
        env::remove_var("CCR_WORKERS");

        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field, .. }) if field == "CCR_WORKERS"
        ));
    }
}

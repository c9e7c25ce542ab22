//! Settings for one invocation: layered configuration plus command-line flags.

use anyhow::{Context, Result};
use ccr_config::ConfigLoader;
use ccr_universe::{Cache, DirResolver, FindOptions, GenerationContext, LocalExecutor, TargetRef, Universe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Values given on the command line. They win over every config layer.
#[derive(Debug, Default)]
pub struct Overrides {
    pub contracts_dir: Option<PathBuf>,
    pub base_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub contracts_dir: PathBuf,
    pub base_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub workers: usize,
    pub cache_max_age: Duration,
    pub verbose: bool,
}

impl Session {
    pub fn load(overrides: Overrides) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to read working directory")?;
        let config = ConfigLoader::new()
            .load_from_directory(&cwd)
            .context("Failed to load configuration")?;

        let session = Self {
            contracts_dir: overrides
                .contracts_dir
                .map(|p| cwd.join(p))
                .unwrap_or_else(|| config.contracts_dir()),
            base_dir: overrides
                .base_dir
                .map(|p| cwd.join(p))
                .unwrap_or_else(|| config.base_dir()),
            cache_dir: overrides
                .cache_dir
                .map(|p| cwd.join(p))
                .unwrap_or_else(|| config.cache_dir()),
            workers: config.workers(),
            cache_max_age: config.cache_max_age(),
            verbose: overrides.verbose,
        };
        debug!(
            contracts = %session.contracts_dir.display(),
            base = %session.base_dir.display(),
            cache = %session.cache_dir.display(),
            workers = session.workers,
            project = ?config.project_root(),
            "session configured"
        );
        Ok(session)
    }

    /// Builtin namespaces plus the contracts tree.
    pub fn find_options(&self) -> FindOptions {
        FindOptions::with_builtins().with_fallback(Arc::new(DirResolver::new(&self.contracts_dir)))
    }

    /// A universe linked from `targets`.
    pub fn universe(&self, targets: &[String]) -> Result<(Universe, Vec<TargetRef>)> {
        let roots: Vec<TargetRef> = targets.iter().map(TargetRef::path).collect();
        let mut universe = Universe::new();
        universe.build(&roots, &self.find_options(), &self.base_dir)?;
        if self.verbose {
            eprintln!("Linked {} targets", universe.len());
        }
        Ok((universe, roots))
    }

    pub fn open_cache(&self) -> Result<Cache> {
        Cache::open(&self.cache_dir)
            .with_context(|| format!("Failed to open cache at {}", self.cache_dir.display()))
    }

    pub fn generation_context(&self) -> Result<GenerationContext> {
        Ok(GenerationContext::new(
            self.open_cache()?,
            Arc::new(LocalExecutor::new()),
        ))
    }
}

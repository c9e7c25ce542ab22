//! CCR target universe
//!
//! Turns declaratively defined targets spread across namespaces into one
//! linked graph, then:
//! - checks artifacts against the checkers and constraints attached to it
//! - generates artifacts into an output directory, building through a
//!   content-addressed cache
//! - plans builds into phases that can run concurrently
//! - fingerprints every reproducible node with a rollup hash
//!
//! # Example
//!
//! ```no_run
//! use ccr_universe::{DirResolver, FindOptions, TargetRef, Universe};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let opts = FindOptions::with_builtins().with_fallback(Arc::new(DirResolver::new("contracts")));
//! let mut universe = Universe::new();
//! universe
//!     .build(&[TargetRef::path("//root:app")], &opts, Path::new("out"))
//!     .unwrap();
//! universe.check(&[TargetRef::path("//root:app")], Path::new("out")).unwrap();
//! ```

pub mod cache;
pub mod common;
pub mod deb;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod phase;
pub mod resolver;
pub mod runner;
pub mod shell;
pub mod target;
pub mod universe;

// Re-export main types
pub use cache::{Cache, FileEntry, Fileset};
pub use error::{ErrorCategory, FailingConstraint, UniverseError, UniverseResult, WrappedError};
pub use evaluator::{AttrEvaluator, CommandEvaluator};
pub use executor::{BuildEnv, BuildExecutor, LocalExecutor};
pub use phase::PhaseExecutor;
pub use resolver::{DirResolver, FindOptions, MemoryResolver, Resolver};
pub use runner::{
    CheckContext, CheckRunner, GenerateContext, GenerateRunner, InputSet, Populator, RunnerEnv,
    RuntimeInfo, StatPopulator,
};
pub use target::{NodeId, Target, TargetRef, TargetType, Value};
pub use universe::{normalize_path, GenerationContext, Universe, BUILD_CACHE_VERSION};

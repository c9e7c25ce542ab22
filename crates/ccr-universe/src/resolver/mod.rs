//! Resolvers turn a target path into a target definition.
//!
//! Paths are either package paths (`//pkg/sub:name`) or namespaced paths
//! (`common://attrs:path`). Namespaced paths go to the resolver registered
//! for their namespace; everything else goes through the fallback list.

pub mod definition;
pub mod dir;

pub use definition::{parse_definitions, DefinitionFile};
pub use dir::DirResolver;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::trace;

use crate::error::{UniverseError, UniverseResult};
use crate::target::Target;

/// Produces a target for a path. A missing target must be reported as
/// [`UniverseError::NotExists`] so that fallbacks can be tried.
pub trait Resolver: Send + Sync {
    fn resolve(&self, path: &str) -> UniverseResult<Target>;
}

impl<F> Resolver for F
where
    F: Fn(&str) -> UniverseResult<Target> + Send + Sync,
{
    fn resolve(&self, path: &str) -> UniverseResult<Target> {
        self(path)
    }
}

#[derive(Clone, Default)]
pub struct FindOptions {
    pub prefix_resolvers: BTreeMap<String, Arc<dyn Resolver>>,
    pub fallback_resolvers: Vec<Arc<dyn Resolver>>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options with the builtin `common://` namespace registered.
    pub fn with_builtins() -> Self {
        Self::new().with_prefix(crate::common::NAMESPACE, Arc::new(crate::common::CommonResolver))
    }

    pub fn with_prefix(mut self, namespace: impl Into<String>, resolver: Arc<dyn Resolver>) -> Self {
        self.prefix_resolvers.insert(namespace.into(), resolver);
        self
    }

    pub fn with_fallback(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.fallback_resolvers.push(resolver);
        self
    }

    /// Find the target for `path`, stamping the path onto it.
    pub fn find(&self, path: &str) -> UniverseResult<Target> {
        if path.is_empty() {
            return Err(UniverseError::resolve(path, "empty target path"));
        }

        if !path.starts_with("//") {
            if let Some((namespace, _)) = path.split_once("://") {
                if let Some(resolver) = self.prefix_resolvers.get(namespace) {
                    trace!(path, namespace, "resolving through prefix resolver");
                    return resolver.resolve(path).map(|t| stamp(t, path));
                }
            }
        }

        for resolver in &self.fallback_resolvers {
            match resolver.resolve(path) {
                Ok(t) => return Ok(stamp(t, path)),
                Err(e) if e.is_not_exists() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(UniverseError::NotExists(path.to_string()))
    }
}

fn stamp(mut target: Target, path: &str) -> Target {
    if target.global_path() != Some(path) {
        target.set_path(path.to_string());
    }
    target
}

/// A fixed table of targets, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    targets: HashMap<String, Target>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, target: Target) -> &mut Self {
        self.targets.insert(path.into(), target);
        self
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl FromIterator<(String, Target)> for MemoryResolver {
    fn from_iter<I: IntoIterator<Item = (String, Target)>>(iter: I) -> Self {
        Self {
            targets: iter.into_iter().collect(),
        }
    }
}

impl Resolver for MemoryResolver {
    fn resolve(&self, path: &str) -> UniverseResult<Target> {
        self.targets
            .get(path)
            .cloned()
            .ok_or_else(|| UniverseError::NotExists(path.to_string()))
    }
}

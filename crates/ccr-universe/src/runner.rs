//! Pluggable checker, generator and populator runners.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{UniverseError, UniverseResult};
use crate::target::{CheckerKind, NodeId, Target, Value};
use crate::universe::Universe;

/// The filesystem view runners operate on: every absolute target path is
/// interpreted relative to `dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerEnv {
    pub dir: PathBuf,
}

impl RunnerEnv {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The running host's own root filesystem.
    pub fn host() -> Self {
        Self::new("/")
    }

    /// Map a target path such as `/usr/bin/app` into this view.
    pub fn fs_path(&self, path: &str) -> PathBuf {
        self.dir.join(path.trim_start_matches('/'))
    }
}

/// What a check runner sees.
pub struct CheckContext<'a> {
    pub universe: &'a Universe,
    pub env: &'a RunnerEnv,
}

/// Resources and components a generator consumes.
#[derive(Debug, Clone, Default)]
pub struct InputSet {
    /// Direct resource and component inputs, in declaration order.
    pub directs: Vec<NodeId>,
    /// Instances of every resource class named as an input, keyed by class.
    pub classed: BTreeMap<NodeId, Vec<NodeId>>,
}

impl InputSet {
    /// Every input node, direct ones first.
    pub fn all(&self) -> Vec<NodeId> {
        let mut out = self.directs.clone();
        for instances in self.classed.values() {
            out.extend(instances.iter().copied());
        }
        out
    }
}

/// What a generate runner sees. Targets created at runtime are buffered
/// with [`GenerateContext::inject`] and linked into the universe after the
/// runner returns.
pub struct GenerateContext<'a> {
    pub universe: &'a Universe,
    pub resource: NodeId,
    pub inputs: &'a InputSet,
    pub env: &'a RunnerEnv,
    injected: Vec<Target>,
}

impl<'a> GenerateContext<'a> {
    pub fn new(
        universe: &'a Universe,
        resource: NodeId,
        inputs: &'a InputSet,
        env: &'a RunnerEnv,
    ) -> Self {
        Self {
            universe,
            resource,
            inputs,
            env,
            injected: Vec::new(),
        }
    }

    pub fn inject(&mut self, target: Target) {
        self.injected.push(target);
    }

    pub(crate) fn into_injected(self) -> Vec<Target> {
        self.injected
    }
}

pub trait CheckRunner: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> CheckerKind;

    /// Populators whose runtime info must be present before the check runs.
    fn populators(&self) -> Vec<&dyn Populator> {
        Vec::new()
    }

    fn check_resource(&self, _ctx: &CheckContext<'_>, _resource: NodeId) -> UniverseResult<()> {
        Err(self.unsupported(CheckerKind::EachResource))
    }

    fn check_attr(&self, _ctx: &CheckContext<'_>, _attr: NodeId) -> UniverseResult<()> {
        Err(self.unsupported(CheckerKind::EachAttr))
    }

    fn check_component(&self, _ctx: &CheckContext<'_>, _component: NodeId) -> UniverseResult<()> {
        Err(self.unsupported(CheckerKind::EachComponent))
    }

    fn check_global(&self, _ctx: &CheckContext<'_>) -> UniverseResult<()> {
        Err(self.unsupported(CheckerKind::Global))
    }

    fn unsupported(&self, kind: CheckerKind) -> UniverseError {
        UniverseError::validation(format!("checker {} cannot run as {}", self.name(), kind))
    }
}

impl fmt::Debug for dyn CheckRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CheckRunner({}, {})", self.name(), self.kind())
    }
}

pub trait GenerateRunner: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, ctx: &mut GenerateContext<'_>) -> UniverseResult<()>;
}

impl fmt::Debug for dyn GenerateRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GenerateRunner({})", self.name())
    }
}

/// Per-node facts gathered by populators, keyed by populator name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeInfo {
    entries: HashMap<String, HashMap<String, Value>>,
}

impl RuntimeInfo {
    pub fn has(&self, populator: &str) -> bool {
        self.entries.contains_key(populator)
    }

    pub fn get(&self, populator: &str, key: &str) -> Option<&Value> {
        self.entries.get(populator).and_then(|m| m.get(key))
    }

    pub fn set(&mut self, populator: &str, key: impl Into<String>, value: Value) {
        self.entries
            .entry(populator.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    pub(crate) fn mark(&mut self, populator: &str) {
        self.entries.entry(populator.to_string()).or_default();
    }

    pub(crate) fn merge(&mut self, other: RuntimeInfo) {
        for (populator, values) in other.entries {
            self.entries.entry(populator).or_default().extend(values);
        }
    }
}

/// Gathers runtime info about one node. Each populator runs at most once
/// per node.
pub trait Populator: Send + Sync {
    fn name(&self) -> &'static str;

    fn populate(
        &self,
        ctx: &CheckContext<'_>,
        node: NodeId,
        info: &mut RuntimeInfo,
    ) -> UniverseResult<()>;
}

/// Records the kind, size and permission bits of a resource's path.
pub struct StatPopulator;

impl StatPopulator {
    pub const NAME: &'static str = "stat";
}

impl Populator for StatPopulator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn populate(
        &self,
        ctx: &CheckContext<'_>,
        node: NodeId,
        info: &mut RuntimeInfo,
    ) -> UniverseResult<()> {
        let path = ctx.universe.determine_path(node, ctx.env)?;
        let fs_path = ctx.env.fs_path(&path);
        match std::fs::symlink_metadata(&fs_path) {
            Ok(meta) => {
                let kind = if meta.file_type().is_symlink() {
                    "symlink"
                } else if meta.is_dir() {
                    "dir"
                } else {
                    "file"
                };
                info.set(Self::NAME, "kind", Value::from(kind));
                info.set(Self::NAME, "size", Value::Int(meta.len() as i64));
                info.set(Self::NAME, "mode", Value::Int(file_mode(&meta) as i64));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info.set(Self::NAME, "kind", Value::from("missing"));
            }
            Err(e) => return Err(UniverseError::io(fs_path, e)),
        }
        Ok(())
    }
}

#[cfg(unix)]
pub(crate) fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn file_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

pub(crate) fn ensure_parent(path: &Path) -> UniverseResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| UniverseError::io(parent, e))?;
    }
    Ok(())
}

//! The universe: every target discovered from a set of roots, linked into a
//! graph.
//!
//! Targets are stored in an arena and addressed by [`NodeId`]. Resolution
//! inserts a node before descending into its edges, so an edge that leads
//! back to a node still being resolved simply links to it. Dependency cycles
//! are therefore legal here; the generation and planning traversals decide
//! which cycles are fatal.

mod check;
mod generate;
mod plan;
mod populate;
mod rollup;

pub use generate::GenerationContext;
pub use rollup::BUILD_CACHE_VERSION;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, trace};

use crate::common;
use crate::error::{UniverseError, UniverseResult};
use crate::evaluator::{AttrEvaluator, CommandEvaluator};
use crate::resolver::FindOptions;
use crate::runner::{CheckContext, Populator, RunnerEnv, RuntimeInfo};
use crate::target::{
    AttrValue, CheckerKind, NodeId, NodeLookup, RefTarget, Target, TargetRef, Value,
};

pub struct Universe {
    nodes: Vec<Target>,
    by_path: HashMap<String, NodeId>,
    enumerated: Vec<NodeId>,
    linked: HashSet<NodeId>,
    class_index: OnceLock<HashMap<NodeId, Vec<NodeId>>>,
    path_index: HashMap<String, NodeId>,
    global_checkers: Vec<NodeId>,
    runtime_info: Mutex<HashMap<NodeId, RuntimeInfo>>,
    rollup_memo: Mutex<HashMap<(NodeId, PathBuf), Vec<u8>>>,
    evaluator: Arc<dyn AttrEvaluator>,
    base_env: RunnerEnv,
    built: bool,
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeLookup for Universe {
    fn node(&self, id: NodeId) -> Option<&Target> {
        self.nodes.get(id.0)
    }
}

impl Universe {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            by_path: HashMap::new(),
            enumerated: Vec::new(),
            linked: HashSet::new(),
            class_index: OnceLock::new(),
            path_index: HashMap::new(),
            global_checkers: Vec::new(),
            runtime_info: Mutex::new(HashMap::new()),
            rollup_memo: Mutex::new(HashMap::new()),
            evaluator: Arc::new(CommandEvaluator),
            base_env: RunnerEnv::host(),
            built: false,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn AttrEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Number of nodes in the arena, anonymous ones included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolve and link every root, then index global checkers and declared
    /// paths. Building again with the same roots is a no-op for nodes that
    /// are already linked.
    pub fn build(&mut self, roots: &[TargetRef], opts: &FindOptions, base: &Path) -> UniverseResult<()> {
        self.built = false;
        for root in roots {
            let mut root = root.clone();
            self.resolve_ref(opts, &mut root)?;
        }
        self.collect_global_checkers();
        self.base_env = RunnerEnv::new(base);
        let env = self.base_env.clone();
        self.build_path_index(&env)?;
        self.built = true;
        debug!(
            nodes = self.nodes.len(),
            named = self.enumerated.len(),
            "universe built"
        );
        Ok(())
    }

    pub(crate) fn ensure_built(&self) -> UniverseResult<()> {
        if self.built {
            Ok(())
        } else {
            Err(UniverseError::NotBuilt)
        }
    }

    /// The node with the given fully qualified path.
    pub fn get(&self, path: &str) -> UniverseResult<NodeId> {
        self.ensure_built()?;
        self.by_path
            .get(path)
            .copied()
            .ok_or_else(|| UniverseError::NotExists(path.to_string()))
    }

    /// The target stored at `id`. Ids handed out by this universe are always
    /// valid.
    pub fn target(&self, id: NodeId) -> &Target {
        &self.nodes[id.0]
    }

    /// Path of the node, or a description for anonymous nodes.
    pub fn label(&self, id: NodeId) -> String {
        match self.nodes.get(id.0) {
            Some(t) => t
                .global_path()
                .map(str::to_string)
                .unwrap_or_else(|| t.to_string()),
            None => format!("#{}", id.0),
        }
    }

    /// Named targets in discovery order.
    pub fn enumerated_targets(&self) -> UniverseResult<Vec<NodeId>> {
        self.ensure_built()?;
        Ok(self.enumerated.clone())
    }

    /// Look up the node an edge points to.
    pub fn lookup_ref(&self, r: &TargetRef) -> UniverseResult<NodeId> {
        match &r.target {
            RefTarget::Resolved(id) => Ok(*id),
            RefTarget::Path(p) => self
                .by_path
                .get(p)
                .copied()
                .ok_or_else(|| UniverseError::NotExists(p.clone())),
            RefTarget::Inline(t) => t
                .global_path()
                .and_then(|p| self.by_path.get(p).copied())
                .ok_or_else(|| UniverseError::resolve(t.to_string(), "inline target was never linked")),
        }
    }

    /// Every currently known instance of `class`, in discovery order.
    pub fn class_instances(&self, class: NodeId) -> Vec<NodeId> {
        self.class_index
            .get_or_init(|| {
                let mut index: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
                for (i, node) in self.nodes.iter().enumerate() {
                    let id = NodeId(i);
                    if !self.linked.contains(&id) {
                        continue;
                    }
                    if let Some(class) = node.class().and_then(TargetRef::id) {
                        index.entry(class).or_default().push(id);
                    }
                }
                index
            })
            .get(&class)
            .cloned()
            .unwrap_or_default()
    }

    fn insert(&mut self, target: Target) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(path) = target.global_path() {
            self.by_path.insert(path.to_string(), id);
            self.enumerated.push(id);
        }
        trace!(node = %target, "inserting node");
        self.nodes.push(target);
        self.class_index = OnceLock::new();
        id
    }

    fn resolve_ref(&mut self, opts: &FindOptions, r: &mut TargetRef) -> UniverseResult<NodeId> {
        let id = match &r.target {
            RefTarget::Resolved(id) => *id,
            RefTarget::Path(path) => match self.by_path.get(path) {
                Some(id) => *id,
                None => {
                    let target = opts.find(path)?;
                    self.insert_and_resolve(opts, target)?
                }
            },
            RefTarget::Inline(target) => {
                match target.global_path().and_then(|p| self.by_path.get(p)) {
                    Some(id) => *id,
                    None => self.insert_and_resolve(opts, (**target).clone())?,
                }
            }
        };
        for constraint in &mut r.constraints {
            self.resolve_ref(opts, &mut constraint.class)?;
        }
        r.target = RefTarget::Resolved(id);
        Ok(id)
    }

    fn insert_and_resolve(&mut self, opts: &FindOptions, target: Target) -> UniverseResult<NodeId> {
        let id = self.insert(target);
        self.resolve_target(opts, id)?;
        Ok(id)
    }

    /// Resolve every edge of `id`, link them, then validate the node.
    fn resolve_target(&mut self, opts: &FindOptions, id: NodeId) -> UniverseResult<()> {
        let mut edges: Vec<TargetRef> = self.nodes[id.0]
            .edges_mut()
            .into_iter()
            .map(|r| r.clone())
            .collect();

        for edge in &mut edges {
            self.resolve_ref(opts, edge)
                .map_err(|e| self.annotate(e, id))?;
        }

        for (slot, edge) in self.nodes[id.0].edges_mut().into_iter().zip(edges) {
            *slot = edge;
        }

        self.nodes[id.0]
            .validate(self)
            .map_err(|e| self.annotate(e, id))?;

        self.linked.insert(id);
        self.class_index = OnceLock::new();
        Ok(())
    }

    /// Attach the node's label and definition position to an error.
    pub(crate) fn annotate(&self, err: UniverseError, id: NodeId) -> UniverseError {
        let err = err.with_target(self.label(id));
        match (self.nodes.get(id.0).and_then(Target::defined_at), err.context()) {
            (Some(pos), Some(ctx)) if ctx.pos.is_none() => err.with_position(pos.clone()),
            _ => err,
        }
    }

    fn collect_global_checkers(&mut self) {
        self.global_checkers = (0..self.nodes.len())
            .map(NodeId)
            .filter(|id| self.linked.contains(id))
            .filter(|id| matches!(&self.nodes[id.0], Target::Checker(c) if c.kind == CheckerKind::Global))
            .collect();
    }

    fn build_path_index(&mut self, env: &RunnerEnv) -> UniverseResult<()> {
        let mut index = HashMap::new();
        for &id in &self.enumerated {
            if let Some(path) = self.declared_path(id, env)? {
                if let Some(other) = index.insert(path.clone(), id) {
                    return Err(UniverseError::validation(format!(
                        "targets {} and {} both declare path {:?}",
                        self.label(other),
                        self.label(id),
                        path
                    )));
                }
            }
        }
        self.path_index = index;
        Ok(())
    }

    fn declared_path(&self, id: NodeId, env: &RunnerEnv) -> UniverseResult<Option<String>> {
        match self.attr_of_class(id, common::PATH_ATTR, env)? {
            None => Ok(None),
            Some(Value::String(p)) => Ok(Some(normalize_path(&p))),
            Some(other) => Err(self.annotate(
                UniverseError::validation(format!(
                    "path attribute must be a string, got {}",
                    other.type_name()
                )),
                id,
            )),
        }
    }

    /// Evaluate the value of an attr node owned by `owner`.
    pub fn attr_value(
        &self,
        attr: NodeId,
        owner: Option<NodeId>,
        env: &RunnerEnv,
    ) -> UniverseResult<Value> {
        let Target::Attr(a) = &self.nodes[attr.0] else {
            return Err(UniverseError::validation(format!(
                "{} is not an attr",
                self.label(attr)
            )));
        };
        match &a.value {
            AttrValue::Literal(v) => Ok(v.clone()),
            AttrValue::Computed(cv) => {
                let owner_target = owner.map(|o| &self.nodes[o.0]);
                self.evaluator
                    .evaluate(a, owner_target, cv, env)
                    .map_err(|e| {
                        let e = e.with_computed_value(cv.to_string());
                        let e = match &cv.pos {
                            Some(pos) => e.with_position(pos.clone()),
                            None => e,
                        };
                        match owner {
                            Some(o) => e.with_target(self.label(o)),
                            None => e.with_target(self.label(attr)),
                        }
                    })
            }
        }
    }

    /// The attr node of `target` whose class has path `class_path`.
    pub(crate) fn attr_node_of_class(&self, target: NodeId, class_path: &str) -> Option<NodeId> {
        let attrs = self.nodes[target.0].attributes()?;
        attrs.iter().filter_map(TargetRef::id).find(|&attr| {
            self.nodes[attr.0]
                .class()
                .and_then(TargetRef::id)
                .and_then(|c| self.nodes[c.0].global_path())
                == Some(class_path)
        })
    }

    fn attr_of_class(
        &self,
        target: NodeId,
        class_path: &str,
        env: &RunnerEnv,
    ) -> UniverseResult<Option<Value>> {
        match self.attr_node_of_class(target, class_path) {
            Some(attr) => self.attr_value(attr, Some(target), env).map(Some),
            None => Ok(None),
        }
    }

    /// The evaluated attribute of `target` whose class is `class_path`.
    pub fn determine_attr_value(
        &self,
        target: NodeId,
        class_path: &str,
        env: &RunnerEnv,
    ) -> UniverseResult<Option<Value>> {
        self.ensure_built()?;
        self.attr_of_class(target, class_path, env)
    }

    /// The declared `common://attrs:path` of `target`.
    pub fn determine_path(&self, target: NodeId, env: &RunnerEnv) -> UniverseResult<String> {
        match self.attr_of_class(target, common::PATH_ATTR, env)? {
            Some(Value::String(p)) => Ok(p),
            Some(other) => Err(UniverseError::validation(format!(
                "path attribute must be a string, got {}",
                other.type_name()
            ))),
            None => Err(UniverseError::validation(format!(
                "{} does not declare a path",
                self.label(target)
            ))),
        }
    }

    /// Attribute of the target at `path` whose own name, or whose class
    /// name, is `name`.
    pub fn query_by_name(
        &self,
        path: &str,
        name: &str,
        env: &RunnerEnv,
    ) -> UniverseResult<Option<Value>> {
        let id = self.get(path)?;
        let Some(attrs) = self.nodes[id.0].attributes() else {
            return Ok(None);
        };
        for attr in attrs.iter().filter_map(TargetRef::id) {
            let node = &self.nodes[attr.0];
            let class_name = node
                .class()
                .and_then(TargetRef::id)
                .map(|c| self.nodes[c.0].name());
            if node.name() == name || class_name == Some(name) {
                return self.attr_value(attr, Some(id), env).map(Some);
            }
        }
        Ok(None)
    }

    /// Attribute of the target at `path` whose class is `class_path`.
    pub fn query_by_class(
        &self,
        path: &str,
        class_path: &str,
        env: &RunnerEnv,
    ) -> UniverseResult<Option<Value>> {
        let id = self.get(path)?;
        self.attr_of_class(id, class_path, env)
    }

    /// The target declaring `path`. When the exact path is unknown, a
    /// symlink resource declared on one of its parent directories is
    /// followed.
    pub fn find_by_path(&self, path: &str, env: &RunnerEnv) -> UniverseResult<Option<NodeId>> {
        self.ensure_built()?;
        let mut current = normalize_path(path);
        for _ in 0..MAX_SYMLINK_HOPS {
            if let Some(id) = self.path_index.get(&current) {
                return Ok(Some(*id));
            }
            match self.follow_symlink_parent(&current, env)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Err(UniverseError::validation(format!(
            "too many symlink hops resolving {:?}",
            path
        )))
    }

    fn follow_symlink_parent(&self, path: &str, env: &RunnerEnv) -> UniverseResult<Option<String>> {
        let mut parent = path;
        while let Some(idx) = parent.rfind('/') {
            parent = &path[..idx];
            if parent.is_empty() {
                break;
            }
            let Some(&id) = self.path_index.get(parent) else {
                continue;
            };
            if !self.is_instance_of(id, common::SYMLINK_CLASS) {
                return Ok(None);
            }
            let Some(Value::String(link)) = self.attr_of_class(id, common::TARGET_ATTR, env)? else {
                return Ok(None);
            };
            let link = if link.starts_with('/') {
                link
            } else {
                let dir = parent.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
                format!("{}/{}", dir, link)
            };
            return Ok(Some(normalize_path(&format!("{}{}", link, &path[idx..]))));
        }
        Ok(None)
    }

    pub(crate) fn is_instance_of(&self, id: NodeId, class_path: &str) -> bool {
        self.nodes[id.0]
            .class()
            .and_then(TargetRef::id)
            .and_then(|c| self.nodes[c.0].global_path())
            == Some(class_path)
    }

    /// Link a target created at runtime against the nodes already known.
    /// Unknown paths are an error; nothing new is resolved from definitions.
    pub fn inject(&mut self, target: Target) -> UniverseResult<NodeId> {
        self.ensure_built()?;
        if let Some(path) = target.global_path() {
            if self.by_path.contains_key(path) {
                return Err(UniverseError::validation(format!(
                    "cannot inject {}: target already exists",
                    path
                )));
            }
        }
        let id = self.insert_and_resolve(&FindOptions::new(), target)?;
        if self.enumerated.last() == Some(&id) {
            if let Some(path) = self.declared_path(id, &self.base_env)? {
                if let Some(other) = self.path_index.get(&path) {
                    return Err(UniverseError::validation(format!(
                        "targets {} and {} both declare path {:?}",
                        self.label(*other),
                        self.label(id),
                        path
                    )));
                }
                self.path_index.insert(path, id);
            }
        }
        self.collect_global_checkers();
        debug!(node = %self.label(id), "injected runtime target");
        Ok(id)
    }

    /// Run the given populators for `id` (each at most once) and return the
    /// accumulated runtime info.
    pub fn runtime_info(
        &self,
        id: NodeId,
        populators: &[&dyn Populator],
        ctx: &CheckContext<'_>,
    ) -> UniverseResult<RuntimeInfo> {
        for populator in populators {
            let done = self
                .runtime_info
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&id)
                .map_or(false, |info| info.has(populator.name()));
            if done {
                continue;
            }
            let mut info = RuntimeInfo::default();
            populator.populate(ctx, id, &mut info)?;
            info.mark(populator.name());
            self.runtime_info
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(id)
                .or_default()
                .merge(info);
        }
        Ok(self
            .runtime_info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    pub(crate) fn global_checkers(&self) -> &[NodeId] {
        &self.global_checkers
    }

    /// Declared paths, sorted.
    pub fn declared_paths(&self) -> Vec<(String, NodeId)> {
        let mut paths: Vec<_> = self.path_index.iter().map(|(p, id)| (p.clone(), *id)).collect();
        paths.sort();
        paths
    }
}

const MAX_SYMLINK_HOPS: usize = 16;

/// Collapse `.`/`..` segments, duplicate and trailing slashes.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests;

//! Target model: the node kinds of the build graph and the edges between them.
//!
//! Nodes live in the universe's arena and are addressed by [`NodeId`]. An edge
//! ([`TargetRef`]) starts out as a path or an inline target and is rewritten to
//! [`RefTarget::Resolved`] once linking succeeds.

pub mod constraint;
pub mod output;
pub mod step;
pub mod value;

pub use constraint::{CompareOp, RefConstraint};
pub use output::{FilenameRules, OutputMapper};
pub use step::{BuildStep, StepKind};
pub use value::{AttrValue, ComputedValue, Value};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{UniverseError, UniverseResult};
use crate::runner::{CheckRunner, GenerateRunner};

/// Where a target was defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefPosition {
    pub file: PathBuf,
    pub line: usize,
}

impl fmt::Display for DefPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

/// Stable index of a node in the universe arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Component,
    Resource,
    ResourceClass,
    Attr,
    AttrClass,
    Checker,
    Generator,
    Build,
    Sieve,
    Toolchain,
    Pseudo,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Component => "component",
            TargetType::Resource => "resource",
            TargetType::ResourceClass => "resource_class",
            TargetType::Attr => "attr",
            TargetType::AttrClass => "attr_class",
            TargetType::Checker => "checker",
            TargetType::Generator => "generator",
            TargetType::Build => "build",
            TargetType::Sieve => "sieve",
            TargetType::Toolchain => "toolchain",
            TargetType::Pseudo => "pseudo",
        }
    }

    /// Whether targets of this type can take part in a rollup hash.
    pub fn is_reproducible(&self) -> bool {
        !matches!(
            self,
            TargetType::Generator | TargetType::Checker | TargetType::AttrClass
        )
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum RefTarget {
    Path(String),
    Inline(Box<Target>),
    Resolved(NodeId),
}

/// An edge to another target, optionally constrained.
#[derive(Debug, Clone)]
pub struct TargetRef {
    pub target: RefTarget,
    pub constraints: Vec<RefConstraint>,
}

impl TargetRef {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            target: RefTarget::Path(path.into()),
            constraints: Vec::new(),
        }
    }

    pub fn inline(target: Target) -> Self {
        Self {
            target: RefTarget::Inline(Box::new(target)),
            constraints: Vec::new(),
        }
    }

    pub fn resolved(id: NodeId) -> Self {
        Self {
            target: RefTarget::Resolved(id),
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, class: impl Into<String>, op: CompareOp, value: Value) -> Self {
        self.constraints.push(RefConstraint {
            class: TargetRef::path(class),
            op,
            value,
        });
        self
    }

    pub fn id(&self) -> Option<NodeId> {
        match self.target {
            RefTarget::Resolved(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&str> {
        match &self.target {
            RefTarget::Path(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            RefTarget::Path(p) => f.write_str(p),
            RefTarget::Inline(t) => write!(f, "inline {}", t),
            RefTarget::Resolved(id) => write!(f, "#{}", id.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckerKind {
    EachResource,
    EachAttr,
    EachComponent,
    Global,
}

impl fmt::Display for CheckerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckerKind::EachResource => "each_resource",
            CheckerKind::EachAttr => "each_attr",
            CheckerKind::EachComponent => "each_component",
            CheckerKind::Global => "global",
        };
        f.write_str(s)
    }
}

/// How a resource's content is taken out of its source fileset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulateStrategy {
    FileFirst,
    FileMatchPath,
    FileMatchBasePath,
    Files,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PseudoKind {
    File,
    Deb,
}

#[derive(Debug, Clone, Default)]
pub struct Component {
    pub path: String,
    pub name: String,
    pub pos: Option<DefPosition>,
    pub details: Vec<TargetRef>,
    pub deps: Vec<TargetRef>,
    pub checks: Vec<TargetRef>,
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub path: String,
    pub name: String,
    pub pos: Option<DefPosition>,
    pub class: TargetRef,
    pub details: Vec<TargetRef>,
    pub deps: Vec<TargetRef>,
    pub source: Option<TargetRef>,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceClass {
    pub path: String,
    pub name: String,
    pub pos: Option<DefPosition>,
    pub deps: Vec<TargetRef>,
    pub checks: Vec<TargetRef>,
    pub populate: Option<PopulateStrategy>,
}

#[derive(Debug, Clone)]
pub struct Attr {
    pub path: String,
    pub name: String,
    pub pos: Option<DefPosition>,
    pub class: TargetRef,
    pub value: AttrValue,
}

#[derive(Debug, Clone, Default)]
pub struct AttrClass {
    pub path: String,
    pub name: String,
    pub pos: Option<DefPosition>,
    pub checks: Vec<TargetRef>,
}

#[derive(Debug, Clone)]
pub struct Checker {
    pub path: String,
    pub name: String,
    pub pos: Option<DefPosition>,
    pub kind: CheckerKind,
    pub runner: Arc<dyn CheckRunner>,
}

#[derive(Debug, Clone)]
pub struct Generator {
    pub path: String,
    pub name: String,
    pub pos: Option<DefPosition>,
    pub inputs: Vec<TargetRef>,
    pub runner: Arc<dyn GenerateRunner>,
}

#[derive(Debug, Clone, Default)]
pub struct Build {
    pub path: String,
    pub name: String,
    pub pos: Option<DefPosition>,
    pub contract_dir: PathBuf,
    pub host_deps: Vec<TargetRef>,
    pub steps: Vec<BuildStep>,
    pub output: FilenameRules,
    pub patch_ins: BTreeMap<String, TargetRef>,
    pub injections: Vec<TargetRef>,
    pub env: HashMap<String, String>,
    pub using_root: Option<TargetRef>,
    pub produces_rootfs: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Sieve {
    pub path: String,
    pub name: String,
    pub pos: Option<DefPosition>,
    pub inputs: Vec<TargetRef>,
    pub add_prefix: String,
    pub renames: Option<FilenameRules>,
    pub exclude_globs: Vec<String>,
    pub include_globs: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Toolchain {
    pub path: String,
    pub name: String,
    pub pos: Option<DefPosition>,
    pub deps: Vec<TargetRef>,
    pub details: Vec<TargetRef>,
    pub binary_mappings: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Pseudo {
    pub kind: PseudoKind,
    pub path: String,
    pub name: String,
    pub pos: Option<DefPosition>,
    pub contract_dir: PathBuf,
    pub file: String,
    pub url: String,
    pub sha256: String,
    pub host: bool,
    pub details: Vec<TargetRef>,
}

#[derive(Debug, Clone)]
pub enum Target {
    Component(Component),
    Resource(Resource),
    ResourceClass(ResourceClass),
    Attr(Attr),
    AttrClass(AttrClass),
    Checker(Checker),
    Generator(Generator),
    Build(Build),
    Sieve(Sieve),
    Toolchain(Toolchain),
    Pseudo(Pseudo),
}

/// Read access to linked nodes, used while validating.
pub trait NodeLookup {
    fn node(&self, id: NodeId) -> Option<&Target>;
}

macro_rules! common_field {
    ($self:ident, $field:ident) => {
        match $self {
            Target::Component(t) => &t.$field,
            Target::Resource(t) => &t.$field,
            Target::ResourceClass(t) => &t.$field,
            Target::Attr(t) => &t.$field,
            Target::AttrClass(t) => &t.$field,
            Target::Checker(t) => &t.$field,
            Target::Generator(t) => &t.$field,
            Target::Build(t) => &t.$field,
            Target::Sieve(t) => &t.$field,
            Target::Toolchain(t) => &t.$field,
            Target::Pseudo(t) => &t.$field,
        }
    };
}

impl Target {
    pub fn target_type(&self) -> TargetType {
        match self {
            Target::Component(_) => TargetType::Component,
            Target::Resource(_) => TargetType::Resource,
            Target::ResourceClass(_) => TargetType::ResourceClass,
            Target::Attr(_) => TargetType::Attr,
            Target::AttrClass(_) => TargetType::AttrClass,
            Target::Checker(_) => TargetType::Checker,
            Target::Generator(_) => TargetType::Generator,
            Target::Build(_) => TargetType::Build,
            Target::Sieve(_) => TargetType::Sieve,
            Target::Toolchain(_) => TargetType::Toolchain,
            Target::Pseudo(_) => TargetType::Pseudo,
        }
    }

    /// The fully qualified path, or `None` for anonymous targets.
    pub fn global_path(&self) -> Option<&str> {
        let path: &String = common_field!(self, path);
        if path.is_empty() {
            None
        } else {
            Some(path)
        }
    }

    pub fn name(&self) -> &str {
        common_field!(self, name)
    }

    pub fn defined_at(&self) -> Option<&DefPosition> {
        common_field!(self, pos).as_ref()
    }

    pub(crate) fn set_path(&mut self, path: String) {
        match self {
            Target::Component(t) => t.path = path,
            Target::Resource(t) => t.path = path,
            Target::ResourceClass(t) => t.path = path,
            Target::Attr(t) => t.path = path,
            Target::AttrClass(t) => t.path = path,
            Target::Checker(t) => t.path = path,
            Target::Generator(t) => t.path = path,
            Target::Build(t) => t.path = path,
            Target::Sieve(t) => t.path = path,
            Target::Toolchain(t) => t.path = path,
            Target::Pseudo(t) => t.path = path,
        }
    }

    /// Class markers hold policy for their instances and are never
    /// generated themselves.
    pub fn is_class(&self) -> bool {
        matches!(self, Target::ResourceClass(_) | Target::AttrClass(_))
    }

    pub fn dependencies(&self) -> Option<&[TargetRef]> {
        match self {
            Target::Component(t) => Some(&t.deps),
            Target::Resource(t) => Some(&t.deps),
            Target::ResourceClass(t) => Some(&t.deps),
            Target::Toolchain(t) => Some(&t.deps),
            _ => None,
        }
    }

    pub fn host_dependencies(&self) -> Option<&[TargetRef]> {
        match self {
            Target::Build(t) => Some(&t.host_deps),
            _ => None,
        }
    }

    /// Edges whose content flows into this target. For builds these are the
    /// patch-ins (sorted by destination) followed by the injections.
    pub fn inputs(&self) -> Option<Vec<&TargetRef>> {
        match self {
            Target::Generator(t) => Some(t.inputs.iter().collect()),
            Target::Sieve(t) => Some(t.inputs.iter().collect()),
            Target::Build(t) => Some(t.patch_ins.values().chain(t.injections.iter()).collect()),
            _ => None,
        }
    }

    pub fn checkers(&self) -> Option<&[TargetRef]> {
        match self {
            Target::Component(t) => Some(&t.checks),
            Target::ResourceClass(t) => Some(&t.checks),
            Target::AttrClass(t) => Some(&t.checks),
            _ => None,
        }
    }

    pub fn attributes(&self) -> Option<&[TargetRef]> {
        match self {
            Target::Component(t) => Some(&t.details),
            Target::Resource(t) => Some(&t.details),
            Target::Toolchain(t) => Some(&t.details),
            Target::Pseudo(t) => Some(&t.details),
            _ => None,
        }
    }

    pub fn class(&self) -> Option<&TargetRef> {
        match self {
            Target::Resource(t) => Some(&t.class),
            Target::Attr(t) => Some(&t.class),
            _ => None,
        }
    }

    pub fn source(&self) -> Option<&TargetRef> {
        match self {
            Target::Resource(t) => t.source.as_ref(),
            _ => None,
        }
    }

    /// Every outgoing edge, in resolution order: class, inputs, deps, host
    /// deps, checkers, attributes, source, then a build's `using_root`.
    pub(crate) fn edges_mut(&mut self) -> Vec<&mut TargetRef> {
        let mut edges: Vec<&mut TargetRef> = Vec::new();
        match self {
            Target::Component(t) => {
                edges.extend(t.deps.iter_mut());
                edges.extend(t.checks.iter_mut());
                edges.extend(t.details.iter_mut());
            }
            Target::Resource(t) => {
                edges.push(&mut t.class);
                edges.extend(t.deps.iter_mut());
                edges.extend(t.details.iter_mut());
                edges.extend(t.source.iter_mut());
            }
            Target::ResourceClass(t) => {
                edges.extend(t.deps.iter_mut());
                edges.extend(t.checks.iter_mut());
            }
            Target::Attr(t) => edges.push(&mut t.class),
            Target::AttrClass(t) => edges.extend(t.checks.iter_mut()),
            Target::Checker(_) => {}
            Target::Generator(t) => edges.extend(t.inputs.iter_mut()),
            Target::Build(t) => {
                edges.extend(t.patch_ins.values_mut());
                edges.extend(t.injections.iter_mut());
                edges.extend(t.host_deps.iter_mut());
                edges.extend(t.using_root.iter_mut());
            }
            Target::Sieve(t) => edges.extend(t.inputs.iter_mut()),
            Target::Toolchain(t) => {
                edges.extend(t.deps.iter_mut());
                edges.extend(t.details.iter_mut());
            }
            Target::Pseudo(t) => edges.extend(t.details.iter_mut()),
        }
        edges
    }

    /// Check the target's own invariants. All direct edges must already be
    /// linked.
    pub fn validate(&self, lookup: &dyn NodeLookup) -> UniverseResult<()> {
        match self {
            Target::Component(t) => {
                validate_deps(lookup, &t.deps)?;
                validate_attrs(lookup, &t.details)?;
                validate_checkers(lookup, &t.checks, CheckerKind::EachComponent)
            }
            Target::Resource(t) => {
                let class = linked(lookup, &t.class)?;
                if !matches!(class, Target::ResourceClass(_)) {
                    return Err(UniverseError::validation(format!(
                        "resource class must be a resource_class, got {}",
                        class.target_type()
                    )));
                }
                validate_deps(lookup, &t.deps)?;
                validate_attrs(lookup, &t.details)?;
                if let Some(src) = &t.source {
                    let src = linked(lookup, src)?;
                    if !matches!(
                        src,
                        Target::Generator(_) | Target::Build(_) | Target::Sieve(_) | Target::Pseudo(_)
                    ) {
                        return Err(UniverseError::validation(format!(
                            "resource source cannot be a {}",
                            src.target_type()
                        )));
                    }
                }
                Ok(())
            }
            Target::ResourceClass(t) => {
                validate_deps(lookup, &t.deps)?;
                validate_checkers(lookup, &t.checks, CheckerKind::EachResource)
            }
            Target::Attr(t) => {
                let class = linked(lookup, &t.class)?;
                if !matches!(class, Target::AttrClass(_)) {
                    return Err(UniverseError::validation(format!(
                        "attr class must be an attr_class, got {}",
                        class.target_type()
                    )));
                }
                if let AttrValue::Computed(cv) = &t.value {
                    if cv.inline.is_empty() && (cv.file.is_empty() || cv.func.is_empty()) {
                        return Err(UniverseError::validation(
                            "computed value needs either inline code or both file and func",
                        ));
                    }
                }
                Ok(())
            }
            Target::AttrClass(t) => validate_checkers(lookup, &t.checks, CheckerKind::EachAttr),
            Target::Checker(t) => {
                if t.runner.kind() != t.kind {
                    return Err(UniverseError::validation(format!(
                        "checker declares kind {} but runner {} is {}",
                        t.kind,
                        t.runner.name(),
                        t.runner.kind()
                    )));
                }
                Ok(())
            }
            Target::Generator(t) => {
                for inp in &t.inputs {
                    let target = linked(lookup, inp)?;
                    if !matches!(
                        target,
                        Target::Resource(_) | Target::ResourceClass(_) | Target::Component(_)
                    ) {
                        return Err(UniverseError::validation(format!(
                            "generator inputs must be resources, resource classes or components, got {}",
                            target.target_type()
                        )));
                    }
                }
                Ok(())
            }
            Target::Build(t) => validate_build(lookup, t),
            Target::Sieve(t) => {
                for inp in &t.inputs {
                    if !inp.constraints.is_empty() {
                        return Err(UniverseError::validation(
                            "sieve inputs cannot carry constraints",
                        ));
                    }
                    let target = linked(lookup, inp)?;
                    if !matches!(target, Target::Build(_) | Target::Sieve(_) | Target::Pseudo(_)) {
                        return Err(UniverseError::validation(format!(
                            "sieve inputs must be builds, sieves or pseudo targets, got {}",
                            target.target_type()
                        )));
                    }
                }
                Ok(())
            }
            Target::Toolchain(t) => {
                validate_deps(lookup, &t.deps)?;
                validate_attrs(lookup, &t.details)?;
                for (name, path) in &t.binary_mappings {
                    if name.is_empty() || path.is_empty() {
                        return Err(UniverseError::validation(
                            "toolchain binary mappings need a name and a path",
                        ));
                    }
                }
                Ok(())
            }
            Target::Pseudo(t) => {
                validate_attrs(lookup, &t.details)?;
                match t.kind {
                    PseudoKind::File => {
                        if t.file.is_empty() {
                            return Err(UniverseError::validation("file target requires a path"));
                        }
                    }
                    PseudoKind::Deb => {
                        if t.file.is_empty() && t.url.is_empty() {
                            return Err(UniverseError::validation(
                                "deb target requires a path or url",
                            ));
                        }
                        if t.sha256.is_empty() {
                            return Err(UniverseError::validation("deb target requires a sha256"));
                        }
                        if t.host {
                            return Err(UniverseError::validation(
                                "deb target cannot be sourced from the host",
                            ));
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

fn linked<'a>(lookup: &'a dyn NodeLookup, r: &TargetRef) -> UniverseResult<&'a Target> {
    r.id()
        .and_then(|id| lookup.node(id))
        .ok_or_else(|| UniverseError::validation(format!("reference {} is not linked", r)))
}

fn validate_deps(lookup: &dyn NodeLookup, deps: &[TargetRef]) -> UniverseResult<()> {
    for dep in deps {
        let target = linked(lookup, dep)?;
        if !matches!(target, Target::Resource(_) | Target::Component(_)) {
            return Err(UniverseError::validation(format!(
                "dependencies must be resources or components, got {}",
                target.target_type()
            )));
        }
    }
    Ok(())
}

fn validate_attrs(lookup: &dyn NodeLookup, attrs: &[TargetRef]) -> UniverseResult<()> {
    for attr in attrs {
        let target = linked(lookup, attr)?;
        if !matches!(target, Target::Attr(_)) {
            return Err(UniverseError::validation(format!(
                "attributes must be attrs, got {}",
                target.target_type()
            )));
        }
    }
    Ok(())
}

fn validate_checkers(
    lookup: &dyn NodeLookup,
    checks: &[TargetRef],
    expected: CheckerKind,
) -> UniverseResult<()> {
    for check in checks {
        match linked(lookup, check)? {
            Target::Checker(c) if c.kind == expected || c.kind == CheckerKind::Global => {}
            Target::Checker(c) => {
                return Err(UniverseError::validation(format!(
                    "checker {} is {}, expected {}",
                    c.path, c.kind, expected
                )))
            }
            other => {
                return Err(UniverseError::validation(format!(
                    "checks must be checkers, got {}",
                    other.target_type()
                )))
            }
        }
    }
    Ok(())
}

fn validate_build(lookup: &dyn NodeLookup, b: &Build) -> UniverseResult<()> {
    for step in &b.steps {
        step.validate()?;
    }
    for dep in &b.host_deps {
        let target = linked(lookup, dep)?;
        if !matches!(
            target,
            Target::Toolchain(_) | Target::Component(_) | Target::Resource(_)
        ) {
            return Err(UniverseError::validation(format!(
                "host dependencies must be toolchains, components or resources, got {}",
                target.target_type()
            )));
        }
    }
    for (dest, patch) in &b.patch_ins {
        if !dest.starts_with('/') {
            return Err(UniverseError::validation(format!(
                "patch-in destination {:?} must be absolute",
                dest
            )));
        }
        validate_injectable(linked(lookup, patch)?)?;
    }
    for injection in &b.injections {
        validate_injectable(linked(lookup, injection)?)?;
    }
    if let Some(root) = &b.using_root {
        match linked(lookup, root)? {
            Target::Build(rb) if rb.produces_rootfs => {}
            Target::Build(rb) => {
                return Err(UniverseError::validation(format!(
                    "using_root target {} does not produce a root filesystem",
                    rb.path
                )))
            }
            other => {
                return Err(UniverseError::validation(format!(
                    "using_root must be a build, got {}",
                    other.target_type()
                )))
            }
        }
    }
    Ok(())
}

fn validate_injectable(target: &Target) -> UniverseResult<()> {
    match target {
        Target::Build(_)
        | Target::Sieve(_)
        | Target::Pseudo(_)
        | Target::Component(_)
        | Target::Resource(_) => Ok(()),
        other => Err(UniverseError::validation(format!(
            "cannot inject a {} into a build",
            other.target_type()
        ))),
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.global_path() {
            Some(path) => write!(f, "{}<{}>", self.target_type(), path),
            None => write!(f, "{}<anonymous {:?}>", self.target_type(), self.name()),
        }
    }
}

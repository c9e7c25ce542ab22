//! TOML definition files.
//!
//! A file `<root>/a/b.toml` defines the package `//a/b`. Each table array
//! declares targets of one kind:
//!
//! ```toml
//! [[component]]
//! name = "app"
//! deps = [":bin"]
//!
//! [[resource]]
//! name = "bin"
//! class = "common://resources:file"
//! attrs = [{ class = "common://attrs:path", value = "/usr/bin/app" }]
//! source = ":build"
//!
//! [[build]]
//! name = "build"
//! steps = [{ kind = "shell_cmd", args = ["mkdir -p usr/bin && echo hi > usr/bin/app"] }]
//! output = { "usr/bin/app" = "usr/bin/app" }
//! ```
//!
//! References starting with `:` are relative to the defining package.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use toml::Spanned;

use crate::common;
use crate::error::{UniverseError, UniverseResult};
use crate::target::{
    Attr, AttrClass, AttrValue, Build, BuildStep, Checker, CheckerKind, CompareOp, Component,
    ComputedValue, DefPosition, FilenameRules, Generator, OutputMapper, PopulateStrategy, Pseudo,
    PseudoKind, RefConstraint, Resource, ResourceClass, Sieve, StepKind, Target, TargetRef,
    Toolchain, Value,
};

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DefinitionFile {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component: Vec<ComponentDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource: Vec<ResourceDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_class: Vec<ResourceClassDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attr: Vec<AttrDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attr_class: Vec<AttrClassDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checker: Vec<CheckerDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generator: Vec<GeneratorDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build: Vec<BuildDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sieve: Vec<SieveDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub toolchain: Vec<ToolchainDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file: Vec<FileDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deb: Vec<DebDef>,
}

/// An edge as written in a definition file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RefDef {
    Path(String),
    Constrained(ConstrainedRef),
    Attr(InlineAttrDef),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConstrainedRef {
    pub path: String,
    #[serde(default)]
    pub constraints: Vec<ConstraintDef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConstraintDef {
    pub class: String,
    pub op: String,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InlineAttrDef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed: Option<ComputedDef>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ComputedDef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub func: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inline: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_write: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentDef {
    pub name: Spanned<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<RefDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<RefDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<RefDef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDef {
    pub name: Spanned<String>,
    pub class: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<RefDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<RefDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceClassDef {
    pub name: Spanned<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<RefDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<RefDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub populate: Option<PopulateStrategy>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AttrDef {
    pub name: Spanned<String>,
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed: Option<ComputedDef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AttrClassDef {
    pub name: Spanned<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<RefDef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CheckerDef {
    pub name: Spanned<String>,
    pub kind: CheckerKind,
    pub runner: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorDef {
    pub name: Spanned<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<RefDef>,
    pub runner: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha256: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub named_args: BTreeMap<String, String>,
}

/// `"literal/path"` or `{ strip_prefix = "usr/" }`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MapperDef {
    Literal(String),
    StripPrefix { strip_prefix: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BuildDef {
    pub name: Spanned<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_deps: Vec<RefDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepDef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output: BTreeMap<String, MapperDef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub patch_ins: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub injections: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub using_root: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub root_fs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SieveDef {
    pub name: Spanned<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub add_prefix: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub renames: BTreeMap<String, MapperDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ToolchainDef {
    pub name: Spanned<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<RefDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<RefDef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub binaries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileDef {
    pub name: Spanned<String>,
    pub path: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub host: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<RefDef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DebDef {
    pub name: Spanned<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<RefDef>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl DefinitionFile {
    pub fn parse(source: &str, file: &Path) -> UniverseResult<Self> {
        toml::from_str(source).map_err(|e| UniverseError::Definition {
            file: file.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Canonical rendering used by `ccr fmt`.
    pub fn to_canonical_string(&self) -> UniverseResult<String> {
        toml::to_string_pretty(self).map_err(|e| UniverseError::validation(e.to_string()))
    }
}

/// Parse one definition file into its targets, keyed by target name.
pub fn parse_definitions(
    source: &str,
    file: &Path,
    package: &str,
) -> UniverseResult<HashMap<String, Target>> {
    let defs = DefinitionFile::parse(source, file)?;
    let loader = Loader {
        source,
        file,
        package,
        contract_dir: file.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    loader.load(defs)
}

struct Loader<'a> {
    source: &'a str,
    file: &'a Path,
    package: &'a str,
    contract_dir: PathBuf,
}

impl Loader<'_> {
    fn load(&self, defs: DefinitionFile) -> UniverseResult<HashMap<String, Target>> {
        let mut targets: Vec<(Spanned<String>, Target)> = Vec::new();

        for d in defs.component {
            let t = Target::Component(Component {
                path: self.qualify_name(&d.name),
                name: d.name.get_ref().clone(),
                pos: Some(self.pos(&d.name)),
                deps: self.refs(&d.deps)?,
                details: self.refs(&d.attrs)?,
                checks: self.refs(&d.checks)?,
            });
            targets.push((d.name, t));
        }
        for d in defs.resource {
            let t = Target::Resource(Resource {
                path: self.qualify_name(&d.name),
                name: d.name.get_ref().clone(),
                pos: Some(self.pos(&d.name)),
                class: TargetRef::path(self.qualify(&d.class)),
                deps: self.refs(&d.deps)?,
                details: self.refs(&d.attrs)?,
                source: d.source.as_deref().map(|s| TargetRef::path(self.qualify(s))),
            });
            targets.push((d.name, t));
        }
        for d in defs.resource_class {
            let t = Target::ResourceClass(ResourceClass {
                path: self.qualify_name(&d.name),
                name: d.name.get_ref().clone(),
                pos: Some(self.pos(&d.name)),
                deps: self.refs(&d.deps)?,
                checks: self.refs(&d.checks)?,
                populate: d.populate,
            });
            targets.push((d.name, t));
        }
        for d in defs.attr {
            let value = self.attr_value(d.value, d.computed, &d.name)?;
            let t = Target::Attr(Attr {
                path: self.qualify_name(&d.name),
                name: d.name.get_ref().clone(),
                pos: Some(self.pos(&d.name)),
                class: TargetRef::path(self.qualify(&d.class)),
                value,
            });
            targets.push((d.name, t));
        }
        for d in defs.attr_class {
            let t = Target::AttrClass(AttrClass {
                path: self.qualify_name(&d.name),
                name: d.name.get_ref().clone(),
                pos: Some(self.pos(&d.name)),
                checks: self.refs(&d.checks)?,
            });
            targets.push((d.name, t));
        }
        for d in defs.checker {
            let runner = common::check_runner(&d.runner, d.kind)
                .ok_or_else(|| self.error(&d.name, format!("unknown checker runner {:?}", d.runner)))?;
            let t = Target::Checker(Checker {
                path: self.qualify_name(&d.name),
                name: d.name.get_ref().clone(),
                pos: Some(self.pos(&d.name)),
                kind: d.kind,
                runner,
            });
            targets.push((d.name, t));
        }
        for d in defs.generator {
            let runner = common::generate_runner(&d.runner).ok_or_else(|| {
                self.error(&d.name, format!("unknown generator runner {:?}", d.runner))
            })?;
            let t = Target::Generator(Generator {
                path: self.qualify_name(&d.name),
                name: d.name.get_ref().clone(),
                pos: Some(self.pos(&d.name)),
                inputs: self.refs(&d.inputs)?,
                runner,
            });
            targets.push((d.name, t));
        }
        for d in defs.build {
            let t = Target::Build(self.build(&d)?);
            targets.push((d.name, t));
        }
        for d in defs.sieve {
            let renames = if d.renames.is_empty() {
                None
            } else {
                Some(rules(&d.renames)?)
            };
            let t = Target::Sieve(Sieve {
                path: self.qualify_name(&d.name),
                name: d.name.get_ref().clone(),
                pos: Some(self.pos(&d.name)),
                inputs: d.inputs.iter().map(|i| TargetRef::path(self.qualify(i))).collect(),
                add_prefix: d.add_prefix,
                renames,
                exclude_globs: d.exclude,
                include_globs: d.include,
            });
            targets.push((d.name, t));
        }
        for d in defs.toolchain {
            let t = Target::Toolchain(Toolchain {
                path: self.qualify_name(&d.name),
                name: d.name.get_ref().clone(),
                pos: Some(self.pos(&d.name)),
                deps: self.refs(&d.deps)?,
                details: self.refs(&d.attrs)?,
                binary_mappings: d.binaries.into_iter().collect(),
            });
            targets.push((d.name, t));
        }
        for d in defs.file {
            let t = Target::Pseudo(Pseudo {
                kind: PseudoKind::File,
                path: self.qualify_name(&d.name),
                name: d.name.get_ref().clone(),
                pos: Some(self.pos(&d.name)),
                contract_dir: self.contract_dir.clone(),
                file: d.path,
                url: String::new(),
                sha256: String::new(),
                host: d.host,
                details: self.refs(&d.attrs)?,
            });
            targets.push((d.name, t));
        }
        for d in defs.deb {
            let t = Target::Pseudo(Pseudo {
                kind: PseudoKind::Deb,
                path: self.qualify_name(&d.name),
                name: d.name.get_ref().clone(),
                pos: Some(self.pos(&d.name)),
                contract_dir: self.contract_dir.clone(),
                file: d.path,
                url: d.url,
                sha256: d.sha256,
                host: false,
                details: self.refs(&d.attrs)?,
            });
            targets.push((d.name, t));
        }

        let mut seen = HashSet::new();
        let mut out = HashMap::new();
        for (name, target) in targets {
            if name.get_ref().is_empty() || name.get_ref().contains(':') {
                return Err(self.error(&name, format!("invalid target name {:?}", name.get_ref())));
            }
            if !seen.insert(name.get_ref().clone()) {
                return Err(self.error(&name, format!("target {:?} defined twice", name.get_ref())));
            }
            out.insert(name.into_inner(), target);
        }
        Ok(out)
    }

    fn build(&self, d: &BuildDef) -> UniverseResult<Build> {
        let mut steps = Vec::with_capacity(d.steps.len());
        for s in &d.steps {
            let mut step = BuildStep::new(s.kind);
            step.pos = Some(self.pos(&d.name));
            step.to_path = s.to_path.clone();
            step.path = s.path.clone();
            step.url = s.url.clone();
            step.sha256 = s.sha256.clone();
            step.dir = s.dir.clone();
            step.args = s.args.clone();
            step.named_args = s.named_args.clone().into_iter().collect();
            steps.push(step);
        }

        Ok(Build {
            path: self.qualify_name(&d.name),
            name: d.name.get_ref().clone(),
            pos: Some(self.pos(&d.name)),
            contract_dir: self.contract_dir.clone(),
            host_deps: self.refs(&d.host_deps)?,
            steps,
            output: rules(&d.output)?,
            patch_ins: d
                .patch_ins
                .iter()
                .map(|(dest, src)| (dest.clone(), TargetRef::path(self.qualify(src))))
                .collect(),
            injections: d.injections.iter().map(|i| TargetRef::path(self.qualify(i))).collect(),
            env: d.env.clone().into_iter().collect(),
            using_root: d.using_root.as_deref().map(|r| TargetRef::path(self.qualify(r))),
            produces_rootfs: d.root_fs,
        })
    }

    fn refs(&self, defs: &[RefDef]) -> UniverseResult<Vec<TargetRef>> {
        defs.iter().map(|d| self.make_ref(d)).collect()
    }

    fn make_ref(&self, def: &RefDef) -> UniverseResult<TargetRef> {
        match def {
            RefDef::Path(p) => Ok(TargetRef::path(self.qualify(p))),
            RefDef::Constrained(c) => {
                let mut r = TargetRef::path(self.qualify(&c.path));
                for constraint in &c.constraints {
                    r.constraints.push(RefConstraint {
                        class: TargetRef::path(self.qualify(&constraint.class)),
                        op: constraint.op.parse::<CompareOp>()?,
                        value: constraint.value.clone(),
                    });
                }
                Ok(r)
            }
            RefDef::Attr(a) => {
                let value = match (&a.value, &a.computed) {
                    (Some(v), None) => AttrValue::Literal(v.clone()),
                    (None, Some(c)) => AttrValue::Computed(self.computed(c)),
                    _ => {
                        return Err(UniverseError::Definition {
                            file: self.file.to_path_buf(),
                            message: format!(
                                "inline attr of class {} needs exactly one of value or computed",
                                a.class
                            ),
                        })
                    }
                };
                Ok(TargetRef::inline(Target::Attr(Attr {
                    path: String::new(),
                    name: a.name.clone(),
                    pos: None,
                    class: TargetRef::path(self.qualify(&a.class)),
                    value,
                })))
            }
        }
    }

    fn attr_value(
        &self,
        value: Option<Value>,
        computed: Option<ComputedDef>,
        name: &Spanned<String>,
    ) -> UniverseResult<AttrValue> {
        match (value, computed) {
            (Some(v), None) => Ok(AttrValue::Literal(v)),
            (None, Some(c)) => {
                let mut cv = self.computed(&c);
                cv.pos = Some(self.pos(name));
                Ok(AttrValue::Computed(cv))
            }
            _ => Err(self.error(name, "attr needs exactly one of value or computed".to_string())),
        }
    }

    fn computed(&self, c: &ComputedDef) -> ComputedValue {
        ComputedValue {
            pos: None,
            contract_dir: self.contract_dir.clone(),
            file: c.file.clone(),
            func: c.func.clone(),
            inline: c.inline.clone(),
            read_write: c.read_write,
        }
    }

    fn qualify(&self, path: &str) -> String {
        if path.starts_with(':') {
            format!("{}{}", self.package, path)
        } else {
            path.to_string()
        }
    }

    fn qualify_name(&self, name: &Spanned<String>) -> String {
        format!("{}:{}", self.package, name.get_ref())
    }

    fn pos(&self, spanned: &Spanned<String>) -> DefPosition {
        let offset = spanned.span().start.min(self.source.len());
        DefPosition {
            file: self.file.to_path_buf(),
            line: self.source[..offset].matches('\n').count() + 1,
        }
    }

    fn error(&self, at: &Spanned<String>, message: String) -> UniverseError {
        UniverseError::Definition {
            file: self.file.to_path_buf(),
            message,
        }
        .with_position(self.pos(at))
    }
}

fn rules(defs: &BTreeMap<String, MapperDef>) -> UniverseResult<FilenameRules> {
    FilenameRules::new(defs.iter().map(|(pattern, mapper)| {
        let mapper = match mapper {
            MapperDef::Literal(p) => OutputMapper::Literal(p.clone()),
            MapperDef::StripPrefix { strip_prefix } => OutputMapper::StripPrefix(strip_prefix.clone()),
        };
        (pattern.as_str(), mapper)
    }))
}

//! The builtin `common://` namespace.
//!
//! Definitions refer to these targets by path, e.g. `common://attrs:path` or
//! `common://resources:file`. Checker and generator definitions name one of
//! the builtin runners below.

mod checks;
mod generators;

pub use checks::{
    AlwaysFail, BooleanValue, DirPresent, Executable, FilePresent, JsonValid, Noop, OctalString,
    SemverValid, SymlinkPresent, UniquePaths,
};
pub use generators::{DirGenerator, ManifestGenerator, SymlinkGenerator};
pub(crate) use generators::{make_symlink, set_mode};

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::error::{UniverseError, UniverseResult};
use crate::resolver::Resolver;
use crate::runner::{CheckRunner, GenerateRunner};
use crate::target::{
    Attr, AttrClass, AttrValue, Checker, CheckerKind, Generator, PopulateStrategy, ResourceClass,
    Target, TargetRef, Toolchain, Value,
};

pub const NAMESPACE: &str = "common";

pub const PATH_ATTR: &str = "common://attrs:path";
pub const MODE_ATTR: &str = "common://attrs:mode";
pub const TARGET_ATTR: &str = "common://attrs:target";
pub const ARCH_ATTR: &str = "common://attrs:arch";
pub const SEMVER_ATTR: &str = "common://attrs:semver";

pub const FILE_CLASS: &str = "common://resources:file";
pub const DIR_CLASS: &str = "common://resources:dir";
pub const SYMLINK_CLASS: &str = "common://resources:symlink";
pub const BINARY_CLASS: &str = "common://resources:binary";
pub const JSON_FILE_CLASS: &str = "common://resources:json_file";
pub const VIRTUAL_CLASS: &str = "common://resources:virtual";

/// Resource classes whose instances are regular files.
pub const FILE_LIKE_CLASSES: [&str; 3] = [FILE_CLASS, BINARY_CLASS, JSON_FILE_CLASS];

const ARCHES: [&str; 4] = ["amd64", "arm64", "x86", "arm"];

/// The builtin check runner registered under `name`. `noop` and
/// `always_fail` adapt to whatever kind they are declared with.
pub fn check_runner(name: &str, kind: CheckerKind) -> Option<Arc<dyn CheckRunner>> {
    let runner: Arc<dyn CheckRunner> = match name {
        "file_present" => Arc::new(FilePresent),
        "dir_present" => Arc::new(DirPresent),
        "symlink_present" => Arc::new(SymlinkPresent),
        "executable" => Arc::new(Executable),
        "json_valid" => Arc::new(JsonValid),
        "octal_string" => Arc::new(OctalString),
        "boolean" => Arc::new(BooleanValue),
        "semver_valid" => Arc::new(SemverValid),
        "unique_paths" => Arc::new(UniquePaths),
        "noop" => Arc::new(Noop(kind)),
        "always_fail" => Arc::new(AlwaysFail(kind)),
        _ => return None,
    };
    Some(runner)
}

pub fn generate_runner(name: &str) -> Option<Arc<dyn GenerateRunner>> {
    let runner: Arc<dyn GenerateRunner> = match name {
        "dir" => Arc::new(DirGenerator),
        "symlink" => Arc::new(SymlinkGenerator),
        "manifest" => Arc::new(ManifestGenerator),
        _ => return None,
    };
    Some(runner)
}

/// Serves the `common://` namespace from a fixed table.
pub struct CommonResolver;

impl Resolver for CommonResolver {
    fn resolve(&self, path: &str) -> UniverseResult<Target> {
        builtins()
            .get(path)
            .cloned()
            .ok_or_else(|| UniverseError::NotExists(path.to_string()))
    }
}

/// Every builtin path, sorted.
pub fn builtin_paths() -> Vec<&'static str> {
    let mut paths: Vec<&'static str> = builtins().keys().copied().collect();
    paths.sort_unstable();
    paths
}

fn builtins() -> &'static HashMap<&'static str, Target> {
    static TABLE: OnceLock<HashMap<&'static str, Target>> = OnceLock::new();
    TABLE.get_or_init(build_table)
}

fn checker(path: &'static str, kind: CheckerKind) -> (&'static str, Target) {
    let name = local_name(path);
    let runner = match check_runner(name, kind) {
        Some(r) => r,
        None => Arc::new(Noop(kind)),
    };
    (
        path,
        Target::Checker(Checker {
            path: path.to_string(),
            name: name.to_string(),
            pos: None,
            kind,
            runner,
        }),
    )
}

fn attr_class(path: &'static str, checks: &[&str]) -> (&'static str, Target) {
    (
        path,
        Target::AttrClass(AttrClass {
            path: path.to_string(),
            name: local_name(path).to_string(),
            pos: None,
            checks: checks.iter().map(|c| TargetRef::path(*c)).collect(),
        }),
    )
}

fn resource_class(
    path: &'static str,
    checks: &[&str],
    populate: Option<PopulateStrategy>,
) -> (&'static str, Target) {
    (
        path,
        Target::ResourceClass(ResourceClass {
            path: path.to_string(),
            name: local_name(path).to_string(),
            pos: None,
            deps: Vec::new(),
            checks: checks.iter().map(|c| TargetRef::path(*c)).collect(),
            populate,
        }),
    )
}

fn generator(path: &'static str) -> Option<(&'static str, Target)> {
    let name = local_name(path);
    let runner = generate_runner(name)?;
    Some((
        path,
        Target::Generator(Generator {
            path: path.to_string(),
            name: name.to_string(),
            pos: None,
            inputs: Vec::new(),
            runner,
        }),
    ))
}

fn local_name(path: &str) -> &str {
    path.rsplit_once(':').map(|(_, n)| n).unwrap_or(path)
}

fn build_table() -> HashMap<&'static str, Target> {
    let mut table: HashMap<&'static str, Target> = HashMap::new();
    let mut add = |(path, target): (&'static str, Target)| {
        table.insert(path, target);
    };

    add(checker("common://checks:file_present", CheckerKind::EachResource));
    add(checker("common://checks:dir_present", CheckerKind::EachResource));
    add(checker("common://checks:symlink_present", CheckerKind::EachResource));
    add(checker("common://checks:executable", CheckerKind::EachResource));
    add(checker("common://checks:json_valid", CheckerKind::EachResource));
    add(checker("common://checks:octal_string", CheckerKind::EachAttr));
    add(checker("common://checks:boolean", CheckerKind::EachAttr));
    add(checker("common://checks:semver_valid", CheckerKind::EachAttr));
    add(checker("common://checks:noop", CheckerKind::EachComponent));
    add(checker("common://checks:always_fail", CheckerKind::EachComponent));
    add(checker("common://checks:unique_paths", CheckerKind::Global));

    add(attr_class(PATH_ATTR, &[]));
    add(attr_class(MODE_ATTR, &["common://checks:octal_string"]));
    add(attr_class(TARGET_ATTR, &[]));
    add(attr_class(ARCH_ATTR, &[]));
    add(attr_class(SEMVER_ATTR, &["common://checks:semver_valid"]));

    for arch in ARCHES {
        let path: &'static str = match arch {
            "amd64" => "common://attrs/arch:amd64",
            "arm64" => "common://attrs/arch:arm64",
            "x86" => "common://attrs/arch:x86",
            _ => "common://attrs/arch:arm",
        };
        add((
            path,
            Target::Attr(Attr {
                path: path.to_string(),
                name: arch.to_string(),
                pos: None,
                class: TargetRef::path(ARCH_ATTR),
                value: AttrValue::Literal(Value::from(arch)),
            }),
        ));
    }

    add(resource_class(
        FILE_CLASS,
        &["common://checks:file_present"],
        Some(PopulateStrategy::FileMatchPath),
    ));
    add(resource_class(
        DIR_CLASS,
        &["common://checks:dir_present"],
        Some(PopulateStrategy::Files),
    ));
    add(resource_class(SYMLINK_CLASS, &["common://checks:symlink_present"], None));
    add(resource_class(
        BINARY_CLASS,
        &["common://checks:file_present", "common://checks:executable"],
        Some(PopulateStrategy::FileMatchPath),
    ));
    add(resource_class(
        JSON_FILE_CLASS,
        &["common://checks:file_present", "common://checks:json_valid"],
        Some(PopulateStrategy::FileMatchPath),
    ));
    add(resource_class(VIRTUAL_CLASS, &[], None));

    for path in [
        "common://generators:dir",
        "common://generators:symlink",
        "common://generators:manifest",
    ] {
        if let Some(entry) = generator(path) {
            add(entry);
        }
    }

    add((
        "common://toolchains:sh",
        Target::Toolchain(Toolchain {
            path: "common://toolchains:sh".to_string(),
            name: "sh".to_string(),
            pos: None,
            deps: Vec::new(),
            details: Vec::new(),
            binary_mappings: HashMap::from([("sh".to_string(), "/bin/sh".to_string())]),
        }),
    ));

    table
}

/// Read a permission mode: integers are taken as-is, strings as octal.
pub fn parse_mode(value: &Value) -> Option<u32> {
    match value {
        Value::Int(i) if (0..=0o7777).contains(i) => Some(*i as u32),
        Value::String(s) => u32::from_str_radix(s.trim_start_matches("0o"), 8)
            .ok()
            .filter(|m| *m <= 0o7777),
        _ => None,
    }
}

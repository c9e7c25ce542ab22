//! Builtin check runners.

use std::collections::BTreeMap;

use crate::error::{UniverseError, UniverseResult};
use crate::runner::{CheckContext, CheckRunner, Populator, StatPopulator};
use crate::target::{CheckerKind, NodeId, Value};

use super::{parse_mode, FILE_LIKE_CLASSES, TARGET_ATTR};

/// The `kind` reported by the stat populator for `resource`.
fn stat_kind(ctx: &CheckContext<'_>, resource: NodeId) -> UniverseResult<(String, Option<i64>)> {
    let info = ctx.universe.runtime_info(resource, &[&StatPopulator], ctx)?;
    let kind = info
        .get(StatPopulator::NAME, "kind")
        .and_then(Value::as_str)
        .unwrap_or("missing")
        .to_string();
    let mode = info.get(StatPopulator::NAME, "mode").and_then(Value::as_int);
    Ok((kind, mode))
}

fn expect_kind(ctx: &CheckContext<'_>, resource: NodeId, want: &str) -> UniverseResult<()> {
    let (kind, _) = stat_kind(ctx, resource)?;
    if kind == want {
        return Ok(());
    }
    let path = ctx.universe.determine_path(resource, ctx.env)?;
    Err(UniverseError::check_failed(format!(
        "{} is not a {} (found {})",
        path, want, kind
    ))
    .with_path(ctx.env.fs_path(&path)))
}

pub struct FilePresent;

impl CheckRunner for FilePresent {
    fn name(&self) -> &str {
        "file_present"
    }

    fn kind(&self) -> CheckerKind {
        CheckerKind::EachResource
    }

    fn populators(&self) -> Vec<&dyn Populator> {
        vec![&StatPopulator]
    }

    fn check_resource(&self, ctx: &CheckContext<'_>, resource: NodeId) -> UniverseResult<()> {
        expect_kind(ctx, resource, "file")
    }
}

pub struct DirPresent;

impl CheckRunner for DirPresent {
    fn name(&self) -> &str {
        "dir_present"
    }

    fn kind(&self) -> CheckerKind {
        CheckerKind::EachResource
    }

    fn populators(&self) -> Vec<&dyn Populator> {
        vec![&StatPopulator]
    }

    fn check_resource(&self, ctx: &CheckContext<'_>, resource: NodeId) -> UniverseResult<()> {
        expect_kind(ctx, resource, "dir")
    }
}

/// The link must exist and, when the resource declares a
/// `common://attrs:target`, point there.
pub struct SymlinkPresent;

impl CheckRunner for SymlinkPresent {
    fn name(&self) -> &str {
        "symlink_present"
    }

    fn kind(&self) -> CheckerKind {
        CheckerKind::EachResource
    }

    fn populators(&self) -> Vec<&dyn Populator> {
        vec![&StatPopulator]
    }

    fn check_resource(&self, ctx: &CheckContext<'_>, resource: NodeId) -> UniverseResult<()> {
        expect_kind(ctx, resource, "symlink")?;
        let Some(Value::String(want)) =
            ctx.universe.determine_attr_value(resource, TARGET_ATTR, ctx.env)?
        else {
            return Ok(());
        };
        let path = ctx.universe.determine_path(resource, ctx.env)?;
        let fs_path = ctx.env.fs_path(&path);
        let got = std::fs::read_link(&fs_path).map_err(|e| UniverseError::io(&fs_path, e))?;
        if got.to_string_lossy() != want {
            return Err(UniverseError::check_failed(format!(
                "{} points to {}, expected {}",
                path,
                got.display(),
                want
            )));
        }
        Ok(())
    }
}

pub struct Executable;

impl CheckRunner for Executable {
    fn name(&self) -> &str {
        "executable"
    }

    fn kind(&self) -> CheckerKind {
        CheckerKind::EachResource
    }

    fn populators(&self) -> Vec<&dyn Populator> {
        vec![&StatPopulator]
    }

    fn check_resource(&self, ctx: &CheckContext<'_>, resource: NodeId) -> UniverseResult<()> {
        let (_, mode) = stat_kind(ctx, resource)?;
        match mode {
            Some(m) if m & 0o111 != 0 => Ok(()),
            _ => {
                let path = ctx.universe.determine_path(resource, ctx.env)?;
                Err(UniverseError::check_failed(format!(
                    "{} is not executable",
                    path
                )))
            }
        }
    }
}

pub struct JsonValid;

impl CheckRunner for JsonValid {
    fn name(&self) -> &str {
        "json_valid"
    }

    fn kind(&self) -> CheckerKind {
        CheckerKind::EachResource
    }

    fn check_resource(&self, ctx: &CheckContext<'_>, resource: NodeId) -> UniverseResult<()> {
        let path = ctx.universe.determine_path(resource, ctx.env)?;
        let fs_path = ctx.env.fs_path(&path);
        let data = std::fs::read(&fs_path).map_err(|e| UniverseError::io(&fs_path, e))?;
        serde_json::from_slice::<serde_json::Value>(&data).map_err(|e| {
            UniverseError::check_failed(format!("{} is not valid JSON: {}", path, e))
                .with_path(fs_path.clone())
        })?;
        Ok(())
    }
}

fn attr_value(ctx: &CheckContext<'_>, attr: NodeId) -> UniverseResult<Value> {
    ctx.universe.attr_value(attr, None, ctx.env)
}

pub struct OctalString;

impl CheckRunner for OctalString {
    fn name(&self) -> &str {
        "octal_string"
    }

    fn kind(&self) -> CheckerKind {
        CheckerKind::EachAttr
    }

    fn check_attr(&self, ctx: &CheckContext<'_>, attr: NodeId) -> UniverseResult<()> {
        let value = attr_value(ctx, attr)?;
        match (&value, parse_mode(&value)) {
            (Value::String(_), Some(_)) => Ok(()),
            _ => Err(UniverseError::check_failed(format!(
                "{:?} is not an octal mode string",
                value.to_string()
            ))),
        }
    }
}

pub struct BooleanValue;

impl CheckRunner for BooleanValue {
    fn name(&self) -> &str {
        "boolean"
    }

    fn kind(&self) -> CheckerKind {
        CheckerKind::EachAttr
    }

    fn check_attr(&self, ctx: &CheckContext<'_>, attr: NodeId) -> UniverseResult<()> {
        match attr_value(ctx, attr)? {
            Value::Bool(_) => Ok(()),
            Value::String(s) if s == "true" || s == "false" => Ok(()),
            other => Err(UniverseError::check_failed(format!(
                "{:?} is not a boolean",
                other.to_string()
            ))),
        }
    }
}

pub struct SemverValid;

impl CheckRunner for SemverValid {
    fn name(&self) -> &str {
        "semver_valid"
    }

    fn kind(&self) -> CheckerKind {
        CheckerKind::EachAttr
    }

    fn check_attr(&self, ctx: &CheckContext<'_>, attr: NodeId) -> UniverseResult<()> {
        let value = attr_value(ctx, attr)?;
        let s = value.to_string();
        semver::Version::parse(s.trim_start_matches('v')).map_err(|e| {
            UniverseError::check_failed(format!("{:?} is not a semantic version: {}", s, e))
        })?;
        Ok(())
    }
}

/// Accepts everything. Takes whatever kind it is declared with.
pub struct Noop(pub CheckerKind);

impl CheckRunner for Noop {
    fn name(&self) -> &str {
        "noop"
    }

    fn kind(&self) -> CheckerKind {
        self.0
    }

    fn check_resource(&self, _: &CheckContext<'_>, _: NodeId) -> UniverseResult<()> {
        Ok(())
    }

    fn check_attr(&self, _: &CheckContext<'_>, _: NodeId) -> UniverseResult<()> {
        Ok(())
    }

    fn check_component(&self, _: &CheckContext<'_>, _: NodeId) -> UniverseResult<()> {
        Ok(())
    }

    fn check_global(&self, _: &CheckContext<'_>) -> UniverseResult<()> {
        Ok(())
    }
}

/// Rejects everything.
pub struct AlwaysFail(pub CheckerKind);

impl AlwaysFail {
    fn fail(&self) -> UniverseError {
        UniverseError::check_failed("always_fail checker was reached")
    }
}

impl CheckRunner for AlwaysFail {
    fn name(&self) -> &str {
        "always_fail"
    }

    fn kind(&self) -> CheckerKind {
        self.0
    }

    fn check_resource(&self, _: &CheckContext<'_>, _: NodeId) -> UniverseResult<()> {
        Err(self.fail())
    }

    fn check_attr(&self, _: &CheckContext<'_>, _: NodeId) -> UniverseResult<()> {
        Err(self.fail())
    }

    fn check_component(&self, _: &CheckContext<'_>, _: NodeId) -> UniverseResult<()> {
        Err(self.fail())
    }

    fn check_global(&self, _: &CheckContext<'_>) -> UniverseResult<()> {
        Err(self.fail())
    }
}

/// No declared path may sit beneath a path declared by a file-like resource.
pub struct UniquePaths;

impl CheckRunner for UniquePaths {
    fn name(&self) -> &str {
        "unique_paths"
    }

    fn kind(&self) -> CheckerKind {
        CheckerKind::Global
    }

    fn check_global(&self, ctx: &CheckContext<'_>) -> UniverseResult<()> {
        let paths = ctx.universe.declared_paths();
        let files: BTreeMap<&str, NodeId> = paths
            .iter()
            .filter(|(_, id)| {
                FILE_LIKE_CLASSES
                    .iter()
                    .any(|class| ctx.universe.is_instance_of(*id, class))
            })
            .map(|(p, id)| (p.as_str(), *id))
            .collect();

        for (path, id) in &paths {
            let mut parent = path.as_str();
            while let Some((dir, _)) = parent.rsplit_once('/') {
                if dir.is_empty() {
                    break;
                }
                if let Some(file) = files.get(dir) {
                    return Err(UniverseError::check_failed(format!(
                        "{} ({}) is declared beneath file {} ({})",
                        path,
                        ctx.universe.label(*id),
                        dir,
                        ctx.universe.label(*file)
                    )));
                }
                parent = dir;
            }
        }
        Ok(())
    }
}

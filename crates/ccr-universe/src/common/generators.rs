//! Builtin generate runners.

use std::path::Path;

use tracing::debug;

use crate::error::{UniverseError, UniverseResult};
use crate::runner::{ensure_parent, GenerateContext, GenerateRunner};
use crate::target::Value;

use super::{parse_mode, MODE_ATTR, PATH_ATTR, TARGET_ATTR};

fn declared_mode(ctx: &GenerateContext<'_>) -> UniverseResult<Option<u32>> {
    match ctx
        .universe
        .determine_attr_value(ctx.resource, MODE_ATTR, ctx.env)?
    {
        None => Ok(None),
        Some(v) => parse_mode(&v)
            .map(Some)
            .ok_or_else(|| UniverseError::generation(format!("invalid mode {:?}", v.to_string()))),
    }
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> UniverseResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| UniverseError::io(path, e))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> UniverseResult<()> {
    Ok(())
}

/// Creates the resource's directory, applying `common://attrs:mode`.
pub struct DirGenerator;

impl GenerateRunner for DirGenerator {
    fn name(&self) -> &str {
        "dir"
    }

    fn run(&self, ctx: &mut GenerateContext<'_>) -> UniverseResult<()> {
        let path = ctx.universe.determine_path(ctx.resource, ctx.env)?;
        let fs_path = ctx.env.fs_path(&path);
        std::fs::create_dir_all(&fs_path).map_err(|e| UniverseError::io(&fs_path, e))?;
        if let Some(mode) = declared_mode(ctx)? {
            set_mode(&fs_path, mode)?;
        }
        debug!(path = %fs_path.display(), "created directory");
        Ok(())
    }
}

/// Creates a symlink at the resource's path pointing at its
/// `common://attrs:target`.
pub struct SymlinkGenerator;

impl GenerateRunner for SymlinkGenerator {
    fn name(&self) -> &str {
        "symlink"
    }

    fn run(&self, ctx: &mut GenerateContext<'_>) -> UniverseResult<()> {
        let path = ctx.universe.determine_path(ctx.resource, ctx.env)?;
        let Some(Value::String(link)) =
            ctx.universe
                .determine_attr_value(ctx.resource, TARGET_ATTR, ctx.env)?
        else {
            return Err(UniverseError::generation(format!(
                "symlink {} needs a string {} attribute",
                path, TARGET_ATTR
            )));
        };
        let fs_path = ctx.env.fs_path(&path);
        ensure_parent(&fs_path)?;
        if std::fs::symlink_metadata(&fs_path).is_ok() {
            std::fs::remove_file(&fs_path).map_err(|e| UniverseError::io(&fs_path, e))?;
        }
        make_symlink(Path::new(&link), &fs_path)?;
        debug!(path = %fs_path.display(), link = %link, "created symlink");
        Ok(())
    }
}

#[cfg(unix)]
pub(crate) fn make_symlink(original: &Path, link: &Path) -> UniverseResult<()> {
    std::os::unix::fs::symlink(original, link).map_err(|e| UniverseError::io(link, e))
}

#[cfg(not(unix))]
pub(crate) fn make_symlink(_original: &Path, link: &Path) -> UniverseResult<()> {
    Err(UniverseError::io(
        link,
        std::io::Error::new(std::io::ErrorKind::Unsupported, "symlinks need a unix host"),
    ))
}

/// Writes the declared paths of every input, sorted, one per line.
pub struct ManifestGenerator;

impl GenerateRunner for ManifestGenerator {
    fn name(&self) -> &str {
        "manifest"
    }

    fn run(&self, ctx: &mut GenerateContext<'_>) -> UniverseResult<()> {
        let mut lines = Vec::new();
        for input in ctx.inputs.all() {
            if let Some(Value::String(p)) =
                ctx.universe.determine_attr_value(input, PATH_ATTR, ctx.env)?
            {
                lines.push(p);
            }
        }
        lines.sort();
        lines.dedup();

        let path = ctx.universe.determine_path(ctx.resource, ctx.env)?;
        let fs_path = ctx.env.fs_path(&path);
        ensure_parent(&fs_path)?;
        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        std::fs::write(&fs_path, body).map_err(|e| UniverseError::io(&fs_path, e))?;
        if let Some(mode) = declared_mode(ctx)? {
            set_mode(&fs_path, mode)?;
        }
        Ok(())
    }
}

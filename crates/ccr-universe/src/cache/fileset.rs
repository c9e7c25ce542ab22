//! Filesets: ordered collections of files produced by builds, sieves and
//! package sources.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::{UniverseError, UniverseResult};
use crate::runner::ensure_parent;
use crate::target::FilenameRules;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative path, without a leading `/` or `./`.
    pub path: String,
    pub mode: u32,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl FileEntry {
    pub fn file(path: &str, mode: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: normalize_entry_path(path),
            mode,
            kind: EntryKind::File,
            data: data.into(),
        }
    }

    pub fn dir(path: &str, mode: u32) -> Self {
        Self {
            path: normalize_entry_path(path),
            mode,
            kind: EntryKind::Dir,
            data: Vec::new(),
        }
    }

    pub fn symlink(path: &str, target: impl Into<String>) -> Self {
        Self {
            path: normalize_entry_path(path),
            mode: 0o777,
            kind: EntryKind::Symlink(target.into()),
            data: Vec::new(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn base_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Write this entry to `dest`, replacing whatever is there.
    pub fn write_to(&self, dest: &Path, mode: Option<u32>) -> UniverseResult<()> {
        match &self.kind {
            EntryKind::Dir => {
                std::fs::create_dir_all(dest).map_err(|e| UniverseError::io(dest, e))?;
            }
            EntryKind::File => {
                ensure_parent(dest)?;
                if std::fs::symlink_metadata(dest).map_or(false, |m| m.file_type().is_symlink()) {
                    std::fs::remove_file(dest).map_err(|e| UniverseError::io(dest, e))?;
                }
                std::fs::write(dest, &self.data).map_err(|e| UniverseError::io(dest, e))?;
            }
            EntryKind::Symlink(target) => {
                ensure_parent(dest)?;
                if std::fs::symlink_metadata(dest).is_ok() {
                    std::fs::remove_file(dest).map_err(|e| UniverseError::io(dest, e))?;
                }
                crate::common::make_symlink(Path::new(target), dest)?;
                return Ok(());
            }
        }
        crate::common::set_mode(dest, mode.unwrap_or(self.mode))
    }
}

/// Strip leading `/` and `./` so every entry path is relative.
pub fn normalize_entry_path(path: &str) -> String {
    let mut p = path;
    loop {
        if let Some(rest) = p.strip_prefix("./") {
            p = rest;
        } else if let Some(rest) = p.strip_prefix('/') {
            p = rest;
        } else {
            break;
        }
    }
    p.trim_end_matches('/').to_string()
}

/// Whether a normalised entry path stays beneath whatever root it is
/// joined onto.
fn is_contained(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn escapes_root(path: &str) -> UniverseError {
    UniverseError::Cache(format!("fileset entry {:?} escapes the output root", path))
}

/// `root/rel`, refusing paths that climb out of `root` either lexically or
/// through a symlinked parent already on disk.
fn contained_dest(root: &Path, rel: &str) -> UniverseResult<PathBuf> {
    if !is_contained(rel) {
        return Err(escapes_root(rel));
    }
    let parts: Vec<Component<'_>> = Path::new(rel).components().collect();
    let mut current = root.to_path_buf();
    let mut canonical_root: Option<PathBuf> = None;
    for part in &parts[..parts.len().saturating_sub(1)] {
        current.push(part);
        let is_link = std::fs::symlink_metadata(&current).map_or(false, |m| m.file_type().is_symlink());
        if !is_link {
            continue;
        }
        let resolved = current
            .canonicalize()
            .map_err(|e| UniverseError::io(&current, e))?;
        if canonical_root.is_none() {
            canonical_root = Some(root.canonicalize().map_err(|e| UniverseError::io(root, e))?);
        }
        if !canonical_root.as_deref().map_or(false, |r| resolved.starts_with(r)) {
            return Err(escapes_root(rel));
        }
    }
    Ok(root.join(rel))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fileset {
    entries: Vec<FileEntry>,
    index: HashMap<String, usize>,
}

impl Fileset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; an entry with the same path is replaced in place.
    pub fn push(&mut self, entry: FileEntry) {
        match self.index.get(&entry.path) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(entry.path.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter()
    }

    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(|e| e.is_file())
    }

    pub fn find(&self, path: &str) -> Option<&FileEntry> {
        self.index
            .get(&normalize_entry_path(path))
            .map(|&i| &self.entries[i])
    }

    pub fn find_base_name(&self, name: &str) -> Option<&FileEntry> {
        self.files().find(|e| e.base_name() == name)
    }

    /// Concatenate filesets in order; later entries replace earlier ones
    /// with the same path.
    pub fn union(sets: impl IntoIterator<Item = Fileset>) -> Fileset {
        let mut out = Fileset::new();
        for set in sets {
            for entry in set.entries {
                out.push(entry);
            }
        }
        out
    }

    /// Drop entries matching any exclude glob, then, when include globs are
    /// given, keep only entries matching one of them.
    pub fn filtered(self, exclude: &[String], include: &[String]) -> UniverseResult<Fileset> {
        let exclude = glob_set(exclude)?;
        let include = if include.is_empty() {
            None
        } else {
            Some(glob_set(include)?)
        };
        Ok(self
            .entries
            .into_iter()
            .filter(|e| !exclude.is_match(&e.path))
            .filter(|e| include.as_ref().map_or(true, |inc| inc.is_match(&e.path)))
            .collect())
    }

    pub fn with_prefix(self, prefix: &str) -> Fileset {
        let prefix = normalize_entry_path(prefix);
        if prefix.is_empty() {
            return self;
        }
        self.entries
            .into_iter()
            .map(|mut e| {
                e.path = format!("{}/{}", prefix, e.path);
                e
            })
            .collect()
    }

    /// Rename entries matching a rule; others keep their name.
    pub fn renamed(self, rules: &FilenameRules) -> Fileset {
        let mut out = Fileset::new();
        for mut e in self.entries {
            if let Some(name) = rules.match_path(&e.path) {
                e.path = normalize_entry_path(&name);
            }
            out.push(e);
        }
        out
    }

    /// Write every entry beneath `root`. Entries that would land outside it
    /// are rejected.
    pub fn write_to_dir(&self, root: &Path) -> UniverseResult<()> {
        for entry in &self.entries {
            let dest = contained_dest(root, &entry.path)?;
            entry.write_to(&dest, None)?;
        }
        Ok(())
    }

    /// Encode as a gzip-compressed tar stream with zeroed timestamps.
    pub fn write_tar_gz<W: Write>(&self, w: W) -> UniverseResult<W> {
        let mut builder = tar::Builder::new(GzEncoder::new(w, Compression::default()));
        for entry in &self.entries {
            let mut header = tar::Header::new_gnu();
            header.set_mode(entry.mode);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            let result = match &entry.kind {
                EntryKind::File => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(entry.data.len() as u64);
                    builder.append_data(&mut header, &entry.path, entry.data.as_slice())
                }
                EntryKind::Dir => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    builder.append_data(&mut header, &entry.path, std::io::empty())
                }
                EntryKind::Symlink(target) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    builder.append_link(&mut header, &entry.path, target)
                }
            };
            result.map_err(|e| {
                UniverseError::Cache(format!("encoding fileset entry {}: {}", entry.path, e))
            })?;
        }
        let encoder = builder
            .into_inner()
            .map_err(|e| UniverseError::Cache(format!("finishing fileset: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| UniverseError::Cache(format!("finishing fileset: {}", e)))
    }

    pub fn read_tar_gz<R: Read>(r: R) -> UniverseResult<Fileset> {
        Self::read_tar(GzDecoder::new(r))
    }

    /// Decode an uncompressed tar stream.
    pub fn read_tar<R: Read>(r: R) -> UniverseResult<Fileset> {
        let corrupt = |e: std::io::Error| UniverseError::Cache(format!("reading fileset: {}", e));
        let mut archive = tar::Archive::new(r);
        let mut out = Fileset::new();
        for entry in archive.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            let path = entry.path().map_err(corrupt)?.to_string_lossy().to_string();
            let path = normalize_entry_path(&path);
            if path.is_empty() {
                continue;
            }
            if !is_contained(&path) {
                return Err(escapes_root(&path));
            }
            let mode = entry.header().mode().map_err(corrupt)?;
            let kind = entry.header().entry_type();
            if kind.is_dir() {
                out.push(FileEntry::dir(&path, mode));
            } else if kind.is_symlink() {
                let target = entry
                    .link_name()
                    .map_err(corrupt)?
                    .map(|t| t.to_string_lossy().to_string())
                    .unwrap_or_default();
                out.push(FileEntry::symlink(&path, target));
            } else if kind.is_file() {
                let mut data = Vec::new();
                entry.read_to_end(&mut data).map_err(corrupt)?;
                out.push(FileEntry::file(&path, mode, data));
            }
        }
        Ok(out)
    }
}

impl FromIterator<FileEntry> for Fileset {
    fn from_iter<I: IntoIterator<Item = FileEntry>>(iter: I) -> Self {
        let mut out = Fileset::new();
        for e in iter {
            out.push(e);
        }
        out
    }
}

fn glob_set(patterns: &[String]) -> UniverseResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        let glob = Glob::new(p.trim_start_matches('/'))
            .map_err(|e| UniverseError::validation(format!("compiling glob {:?}: {}", p, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| UniverseError::validation(format!("compiling globs: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::OutputMapper;
    use pretty_assertions::assert_eq;

    fn sample() -> Fileset {
        [
            FileEntry::dir("usr/bin", 0o755),
            FileEntry::file("/usr/bin/app", 0o755, b"#!/bin/sh\n".to_vec()),
            FileEntry::file("./usr/share/doc/README", 0o644, b"docs".to_vec()),
            FileEntry::symlink("usr/bin/app2", "app"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_paths_are_normalised() {
        let fs = sample();
        assert!(fs.find("usr/bin/app").is_some());
        assert!(fs.find("/usr/share/doc/README").is_some());
        assert_eq!(fs.find_base_name("README").unwrap().data, b"docs");
    }

    #[test]
    fn test_tar_gz_encoding_preserves_entries() {
        let fs = sample();
        let bytes = fs.write_tar_gz(Vec::new()).unwrap();
        let back = Fileset::read_tar_gz(bytes.as_slice()).unwrap();
        assert_eq!(back, fs);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = sample().write_tar_gz(Vec::new()).unwrap();
        let b = sample().write_tar_gz(Vec::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sieve_operations() {
        let fs = sample()
            .filtered(&["usr/share/**".to_string()], &[])
            .unwrap()
            .with_prefix("/opt/")
            .renamed(
                &FilenameRules::new([("opt/usr/bin/app", OutputMapper::Literal("opt/bin/app".into()))])
                    .unwrap(),
            );
        let paths: Vec<&str> = fs.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["opt/usr/bin", "opt/bin/app", "opt/usr/bin/app2"]);
    }

    #[test]
    fn test_include_globs_keep_only_matches() {
        let fs = sample().filtered(&[], &["**/README".to_string()]).unwrap();
        assert_eq!(fs.len(), 1);
    }

    #[test]
    fn test_union_later_sets_override() {
        let a: Fileset = [FileEntry::file("x", 0o644, b"a".to_vec())].into_iter().collect();
        let b: Fileset = [
            FileEntry::file("y", 0o644, b"b".to_vec()),
            FileEntry::file("x", 0o600, b"c".to_vec()),
        ]
        .into_iter()
        .collect();
        let u = Fileset::union([a, b]);
        assert_eq!(u.len(), 2);
        assert_eq!(u.find("x").unwrap().data, b"c");
        assert_eq!(u.iter().next().unwrap().path, "x");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        sample().write_to_dir(dir.path()).unwrap();
        assert_eq!(std::fs::read(dir.path().join("usr/bin/app")).unwrap(), b"#!/bin/sh\n");
        assert_eq!(
            std::fs::read_link(dir.path().join("usr/bin/app2")).unwrap(),
            std::path::PathBuf::from("app")
        );
    }

    /// A tar stream with one regular file whose raw header name is `name`.
    /// The tar builder refuses `..`, so the header is filled in by hand.
    fn raw_tar(name: &str, data: &[u8]) -> Vec<u8> {
        let mut header = tar::Header::new_old();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        header.set_cksum();
        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, data).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_read_tar_rejects_parent_components() {
        let bytes = raw_tar("../escape.txt", b"gotcha");
        let err = Fileset::read_tar(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, UniverseError::Cache(_)));
        assert!(err.to_string().contains("escapes the output root"));

        let nested = raw_tar("usr/../../escape.txt", b"gotcha");
        assert!(Fileset::read_tar(nested.as_slice()).is_err());
    }

    #[test]
    fn test_write_to_dir_rejects_renamed_escape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let fs: Fileset = [FileEntry::file("x", 0o644, b"x".to_vec())]
            .into_iter()
            .collect::<Fileset>()
            .renamed(
                &FilenameRules::new([("x", OutputMapper::Literal("../escape.txt".into()))]).unwrap(),
            );

        assert!(fs.write_to_dir(&root).is_err());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_to_dir_refuses_symlinked_parent_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();

        let fs: Fileset = [
            FileEntry::symlink("link", outside.to_string_lossy()),
            FileEntry::file("link/pwned", 0o644, b"x".to_vec()),
        ]
        .into_iter()
        .collect();
        let err = fs.write_to_dir(&root).unwrap_err();
        assert!(err.to_string().contains("escapes the output root"));
        assert!(!outside.join("pwned").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_to_dir_follows_symlinked_parent_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let fs: Fileset = [
            FileEntry::dir("usr/lib", 0o755),
            FileEntry::symlink("lib", "usr/lib"),
            FileEntry::file("lib/libz.so", 0o644, b"elf".to_vec()),
        ]
        .into_iter()
        .collect();
        fs.write_to_dir(dir.path()).unwrap();
        assert_eq!(std::fs::read(dir.path().join("usr/lib/libz.so")).unwrap(), b"elf");
    }
}

//! Content-addressed cache of build outputs.
//!
//! Filesets are stored as gzip-compressed tar streams under
//! `<dir>/hash/<c>/<rest>`, keyed by a node's rollup hash. Entries are
//! write-once: committing a key that already exists leaves it untouched.
//! Downloaded blobs (package archives) live under `<dir>/named/`.

mod fileset;

pub use fileset::{normalize_entry_path, EntryKind, FileEntry, Fileset};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{UniverseError, UniverseResult};

/// Length of the encoded key used for on-disk names.
const KEY_LEN: usize = 36;

#[derive(Debug, Clone)]
pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    /// Open (creating if necessary) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> UniverseResult<Self> {
        let dir = dir.into();
        for sub in ["hash", "named"] {
            let p = dir.join(sub);
            fs::create_dir_all(&p).map_err(|e| UniverseError::io(&p, e))?;
        }
        Ok(Self { dir })
    }

    /// Platform cache directory plus `ccr`.
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("ccr")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The printable key for a rollup hash.
    pub fn hash_string(hash: &[u8]) -> String {
        let mut s = URL_SAFE_NO_PAD.encode(hash);
        s.truncate(KEY_LEN);
        s
    }

    fn hash_path(&self, hash: &[u8]) -> PathBuf {
        let key = Self::hash_string(hash);
        let (head, rest) = key.split_at(1.min(key.len()));
        self.dir.join("hash").join(head).join(rest)
    }

    pub fn is_hash_cached(&self, hash: &[u8]) -> bool {
        self.hash_path(hash).is_file()
    }

    /// The fileset committed under `hash`, or [`UniverseError::CacheMiss`].
    pub fn fileset(&self, hash: &[u8]) -> UniverseResult<Fileset> {
        let path = self.hash_path(hash);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UniverseError::CacheMiss)
            }
            Err(e) => return Err(UniverseError::io(&path, e)),
        };
        Fileset::read_tar_gz(BufReader::new(file)).map_err(|e| e.with_path(path))
    }

    /// Store `fileset` under `hash`. The stream is written to a temporary
    /// file in the same directory and renamed into place.
    pub fn commit_fileset(&self, hash: &[u8], fileset: &Fileset) -> UniverseResult<()> {
        let path = self.hash_path(hash);
        if path.is_file() {
            debug!(key = %Self::hash_string(hash), "cache entry already committed");
            return Ok(());
        }
        let parent = path
            .parent()
            .ok_or_else(|| UniverseError::Cache(format!("bad cache path {}", path.display())))?;
        fs::create_dir_all(parent).map_err(|e| UniverseError::io(parent, e))?;

        let tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| UniverseError::io(parent, e))?;
        let writer = fileset.write_tar_gz(BufWriter::new(tmp))?;
        let tmp = writer
            .into_inner()
            .map_err(|e| UniverseError::io(&path, e.into_error()))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| UniverseError::io(&path, e))?;
        if persist_once(tmp, &path)? {
            debug!(key = %Self::hash_string(hash), files = fileset.len(), "committed fileset");
        } else {
            debug!(key = %Self::hash_string(hash), "cache entry committed concurrently");
        }
        Ok(())
    }

    /// A single file from the fileset committed under `hash`.
    pub fn file_in_fileset(&self, hash: &[u8], name: &str) -> UniverseResult<FileEntry> {
        let fileset = self.fileset(hash)?;
        fileset.find(name).cloned().ok_or_else(|| {
            UniverseError::Cache(format!(
                "{} missing from fileset {}",
                name,
                Self::hash_string(hash)
            ))
        })
    }

    pub fn named_path(&self, name: &str) -> PathBuf {
        self.dir.join("named").join(name)
    }

    /// Path of a named blob, if present.
    pub fn by_name(&self, name: &str) -> Option<PathBuf> {
        let p = self.named_path(name);
        p.is_file().then_some(p)
    }

    /// Store a named blob, replacing any previous content.
    pub fn put_named(&self, name: &str, data: &[u8]) -> UniverseResult<PathBuf> {
        let path = self.named_path(name);
        let parent = self.dir.join("named");
        let mut tmp =
            tempfile::NamedTempFile::new_in(&parent).map_err(|e| UniverseError::io(&parent, e))?;
        tmp.write_all(data).map_err(|e| UniverseError::io(&path, e))?;
        tmp.persist(&path)
            .map_err(|e| UniverseError::io(&path, e.error))?;
        Ok(path)
    }

    /// Remove hash entries committed longer than `max_age` ago. Returns the
    /// number of entries removed.
    pub fn clean(&self, max_age: Duration) -> UniverseResult<usize> {
        let horizon = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let root = self.dir.join("hash");
        let mut removed = 0;
        for entry in WalkDir::new(&root).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable cache entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if modified <= horizon {
                fs::remove_file(entry.path()).map_err(|e| UniverseError::io(entry.path(), e))?;
                removed += 1;
            }
        }
        debug!(removed, "cleaned cache");
        Ok(removed)
    }
}

/// Move `tmp` to `path` unless something is already there. Returns whether
/// this call created the entry.
fn persist_once(tmp: tempfile::NamedTempFile, path: &Path) -> UniverseResult<bool> {
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(UniverseError::io(path, e.error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Fileset {
        [FileEntry::file("usr/bin/app", 0o755, b"hello".to_vec())]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_hash_string_is_url_safe_and_truncated() {
        let s = Cache::hash_string(&[0xfb; 32]);
        assert_eq!(s.len(), KEY_LEN);
        assert!(!s.contains('+') && !s.contains('/') && !s.contains('='));
    }

    #[test]
    fn test_miss_then_commit_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let hash = [7u8; 32];

        assert!(cache.fileset(&hash).unwrap_err().is_cache_miss());
        cache.commit_fileset(&hash, &sample()).unwrap();
        assert!(cache.is_hash_cached(&hash));
        assert_eq!(cache.fileset(&hash).unwrap(), sample());
        assert_eq!(cache.file_in_fileset(&hash, "/usr/bin/app").unwrap().data, b"hello");
        assert!(cache.file_in_fileset(&hash, "nope").is_err());
    }

    #[test]
    fn test_commit_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let hash = [1u8; 32];
        cache.commit_fileset(&hash, &sample()).unwrap();
        let other: Fileset = [FileEntry::file("x", 0o644, b"x".to_vec())].into_iter().collect();
        cache.commit_fileset(&hash, &other).unwrap();
        assert_eq!(cache.fileset(&hash).unwrap(), sample());
    }

    #[test]
    fn test_persist_never_replaces_an_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry");
        fs::write(&path, b"first").unwrap();

        let mut tmp = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        tmp.write_all(b"second").unwrap();
        assert!(!persist_once(tmp, &path).unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"first");

        let fresh = dir.path().join("fresh");
        let mut tmp = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        tmp.write_all(b"new").unwrap();
        assert!(persist_once(tmp, &fresh).unwrap());
        assert_eq!(fs::read(&fresh).unwrap(), b"new");
    }

    #[test]
    fn test_layout_splits_first_character() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let hash = [9u8; 32];
        cache.commit_fileset(&hash, &sample()).unwrap();
        let key = Cache::hash_string(&hash);
        assert!(dir.path().join("hash").join(&key[..1]).join(&key[1..]).is_file());
    }

    #[test]
    fn test_named_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        assert!(cache.by_name("abc").is_none());
        let p = cache.put_named("abc", b"blob").unwrap();
        assert_eq!(cache.by_name("abc"), Some(p.clone()));
        assert_eq!(fs::read(p).unwrap(), b"blob");
    }

    #[test]
    fn test_clean_honours_horizon() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        cache.commit_fileset(&[2u8; 32], &sample()).unwrap();
        assert_eq!(cache.clean(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(cache.clean(Duration::ZERO).unwrap(), 1);
        assert!(!cache.is_hash_cached(&[2u8; 32]));
    }
}

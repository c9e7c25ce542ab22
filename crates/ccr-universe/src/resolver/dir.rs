//! Resolver backed by a tree of TOML definition files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;
use walkdir::WalkDir;

use super::definition::parse_definitions;
use super::Resolver;
use crate::error::{UniverseError, UniverseResult};
use crate::target::Target;

type Package = Arc<HashMap<String, Target>>;

/// Maps `//a/b:name` to target `name` in `<root>/a/b.toml`.
///
/// Each file is parsed once; later lookups are served from memory.
pub struct DirResolver {
    root: PathBuf,
    packages: Mutex<HashMap<String, Package>>,
}

impl DirResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            packages: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_file(&self, package: &str) -> PathBuf {
        self.root.join(format!("{}.toml", package.trim_start_matches("//")))
    }

    /// Every definition file under the root, sorted.
    pub fn definition_files(&self) -> UniverseResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = entry.map_err(|e| {
                UniverseError::io(
                    e.path().unwrap_or(&self.root).to_path_buf(),
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })?;
            if entry.file_type().is_file()
                && entry.path().extension().map_or(false, |ext| ext == "toml")
            {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    fn load_package(&self, package: &str) -> UniverseResult<Option<Package>> {
        let mut packages = self
            .packages
            .lock()
            .map_err(|_| UniverseError::resolve(package, "definition cache poisoned"))?;
        if let Some(p) = packages.get(package) {
            return Ok(Some(Arc::clone(p)));
        }

        let file = self.package_file(package);
        let source = match std::fs::read_to_string(&file) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(UniverseError::io(file, e)),
        };
        debug!(file = %file.display(), "loading definitions");
        let targets = Arc::new(parse_definitions(&source, &file, package)?);
        packages.insert(package.to_string(), Arc::clone(&targets));
        Ok(Some(targets))
    }
}

impl Resolver for DirResolver {
    fn resolve(&self, path: &str) -> UniverseResult<Target> {
        let Some(rest) = path.strip_prefix("//") else {
            return Err(UniverseError::NotExists(path.to_string()));
        };
        let Some((package, name)) = rest.rsplit_once(':') else {
            return Err(UniverseError::resolve(path, "target path must look like //package:name"));
        };
        if package.is_empty() || name.is_empty() {
            return Err(UniverseError::resolve(path, "target path must look like //package:name"));
        }

        let package = format!("//{}", package);
        match self.load_package(&package)? {
            Some(targets) => targets
                .get(name)
                .cloned()
                .ok_or_else(|| UniverseError::NotExists(path.to_string())),
            None => Err(UniverseError::NotExists(path.to_string())),
        }
    }
}

//! Materializing a resource from the fileset of its source.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{GenerationContext, Universe};
use crate::cache::{normalize_entry_path, FileEntry, Fileset};
use crate::common::{self, parse_mode};
use crate::deb;
use crate::error::{UniverseError, UniverseResult};
use crate::runner::{file_mode, RunnerEnv};
use crate::target::{NodeId, PopulateStrategy, Pseudo, PseudoKind, Target};

impl Universe {
    /// How the content of `resource` is picked out of the fileset of
    /// `source`.
    pub(crate) fn populate_strategy(&self, resource: NodeId, source: NodeId) -> PopulateStrategy {
        match self.target(source) {
            Target::Pseudo(p) if p.kind == PseudoKind::File => PopulateStrategy::FileFirst,
            Target::Pseudo(_) => PopulateStrategy::FileMatchBasePath,
            _ => self
                .target(resource)
                .class()
                .and_then(|c| c.id())
                .and_then(|c| match self.target(c) {
                    Target::ResourceClass(rc) => rc.populate,
                    _ => None,
                })
                .unwrap_or(PopulateStrategy::Files),
        }
    }

    /// Every file provided by a build, sieve or pseudo source. Build outputs
    /// must already be committed to the cache.
    pub(crate) fn fileset_for_source(
        &self,
        ctx: &GenerationContext,
        source: NodeId,
        env: &RunnerEnv,
    ) -> UniverseResult<Fileset> {
        let files = match self.target(source) {
            Target::Pseudo(p) => match p.kind {
                PseudoKind::File => pseudo_file(p),
                PseudoKind::Deb => deb::deb_fileset(&ctx.cache, p),
            },
            Target::Build(_) => {
                let hash = self.rollup_hash(source, env)?;
                ctx.cache.fileset(&hash).map_err(|e| {
                    if e.is_cache_miss() {
                        UniverseError::generation(format!(
                            "output of {} is not in the cache",
                            self.label(source)
                        ))
                    } else {
                        e
                    }
                })
            }
            Target::Sieve(s) => {
                let mut sets = Vec::with_capacity(s.inputs.len());
                for input in &s.inputs {
                    let input = self.lookup_ref(input)?;
                    sets.push(self.fileset_for_source(ctx, input, env)?);
                }
                let mut files = Fileset::union(sets)
                    .filtered(&s.exclude_globs, &s.include_globs)?
                    .with_prefix(&s.add_prefix);
                if let Some(renames) = &s.renames {
                    files = files.renamed(renames);
                }
                Ok(files)
            }
            other => Err(UniverseError::validation(format!(
                "cannot obtain fileset for source of type {}",
                other.target_type()
            ))),
        };
        files.map_err(|e| e.with_action_target(self.label(source)))
    }

    /// Write `resource` beneath `out`, taking its content from its source.
    /// Attribute values are evaluated in `env`.
    pub(crate) fn populate_resource(
        &self,
        ctx: &GenerationContext,
        resource: NodeId,
        env: &RunnerEnv,
        out: &Path,
    ) -> UniverseResult<()> {
        let source = match self.target(resource).source() {
            Some(src) => self.lookup_ref(src)?,
            None => {
                return Err(UniverseError::generation(format!(
                    "{} has no source to populate from",
                    self.label(resource)
                )))
            }
        };
        if matches!(self.target(source), Target::Generator(_)) {
            return Err(UniverseError::generation(
                "generator sources are run, not populated",
            ));
        }

        let path = self.determine_path(resource, env)?;
        let dest: PathBuf = out.join(path.trim_start_matches('/'));
        let mode = match self.attr_of_class(resource, common::MODE_ATTR, env)? {
            None => None,
            Some(v) => Some(parse_mode(&v).ok_or_else(|| {
                UniverseError::generation(format!("invalid mode {:?}", v.to_string()))
            })?),
        };

        let files = self.fileset_for_source(ctx, source, env)?;
        let strategy = self.populate_strategy(resource, source);
        debug!(resource = %self.label(resource), ?strategy, files = files.len(), "populating");

        let entry = match strategy {
            PopulateStrategy::Files => {
                files.write_to_dir(&dest)?;
                if let Some(mode) = mode {
                    common::set_mode(&dest, mode)?;
                }
                return Ok(());
            }
            PopulateStrategy::FileFirst => files.files().next(),
            PopulateStrategy::FileMatchPath => files.find(&normalize_entry_path(&path)),
            PopulateStrategy::FileMatchBasePath => {
                let base = path.rsplit('/').next().unwrap_or(&path);
                files.find_base_name(base)
            }
        };

        let Some(entry) = entry else {
            let err = match self.target(source) {
                Target::Build(_) => UniverseError::generation("file missing from build output"),
                _ => UniverseError::generation(format!(
                    "{} not found in {}",
                    path,
                    self.label(source)
                )),
            };
            return Err(err.with_path(path).with_action_target(self.label(source)));
        };
        entry.write_to(&dest, mode)
    }
}

fn pseudo_file(p: &Pseudo) -> UniverseResult<Fileset> {
    let path = if p.host {
        PathBuf::from(&p.file)
    } else {
        p.contract_dir.join(&p.file)
    };
    let meta = std::fs::metadata(&path).map_err(|e| UniverseError::io(&path, e))?;
    let data = std::fs::read(&path).map_err(|e| UniverseError::io(&path, e))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| p.file.clone());
    Ok([FileEntry::file(&name, file_mode(&meta), data)]
        .into_iter()
        .collect())
}

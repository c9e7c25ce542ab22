//! Build execution.
//!
//! The generation engine only needs "run these steps in a disposable
//! filesystem, then let me read the tree back". [`BuildExecutor`] hands out
//! a [`BuildEnv`] per build; [`LocalExecutor`] backs it with a scratch
//! directory on the host.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cache::{Cache, FileEntry, Fileset};
use crate::deb;
use crate::error::{UniverseError, UniverseResult};
use crate::runner::file_mode;
use crate::shell;
use crate::target::{Build, BuildStep, FilenameRules, StepKind};

/// Environment variable naming the scratch root inside build commands.
pub const ROOT_VAR: &str = "CCR_ROOT";

/// One running build.
pub trait BuildEnv: Send {
    /// Directory the build's filesystem is rooted at.
    fn root(&self) -> &Path;

    fn run_step(&mut self, step: &BuildStep) -> UniverseResult<()>;

    /// Tear the environment down. Captured outputs must be read first.
    fn close(self: Box<Self>) -> UniverseResult<()>;
}

pub trait BuildExecutor: Send + Sync {
    fn new_env(&self, build: &Build, cache: &Cache) -> UniverseResult<Box<dyn BuildEnv>>;
}

impl fmt::Debug for dyn BuildExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BuildExecutor")
    }
}

/// Runs steps directly on the host with a fresh temporary root per build.
/// Commands run with the root as working directory and its location in
/// `$CCR_ROOT`; nothing stops them touching the rest of the host.
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor {
    /// Where scratch roots are created. Defaults to the system temp dir.
    pub scratch_dir: Option<PathBuf>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BuildExecutor for LocalExecutor {
    fn new_env(&self, build: &Build, cache: &Cache) -> UniverseResult<Box<dyn BuildEnv>> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ccr-build-");
        let dir = match &self.scratch_dir {
            Some(d) => builder.tempdir_in(d).map_err(|e| UniverseError::io(d, e))?,
            None => builder
                .tempdir()
                .map_err(|e| UniverseError::io(std::env::temp_dir(), e))?,
        };
        let mut envs = build.env.clone();
        envs.insert(ROOT_VAR.to_string(), dir.path().display().to_string());
        debug!(build = %build.path, root = %dir.path().display(), "created build root");
        Ok(Box::new(LocalEnv {
            dir,
            contract_dir: build.contract_dir.clone(),
            envs,
            cache: cache.clone(),
        }))
    }
}

struct LocalEnv {
    dir: tempfile::TempDir,
    contract_dir: PathBuf,
    envs: HashMap<String, String>,
    cache: Cache,
}

impl LocalEnv {
    fn in_root(&self, path: &str) -> PathBuf {
        self.dir.path().join(path.trim_start_matches('/'))
    }

    fn unpack(&self, step: &BuildStep) -> UniverseResult<()> {
        let data = if !step.path.is_empty() {
            let p = self.contract_dir.join(&step.path);
            std::fs::read(&p).map_err(|e| UniverseError::io(p, e))?
        } else {
            self.fetch(step)?
        };
        let files = Fileset::read_tar_gz(data.as_slice())?;
        files.write_to_dir(&self.in_root(&step.to_path))
    }

    fn fetch(&self, step: &BuildStep) -> UniverseResult<Vec<u8>> {
        if step.sha256.is_empty() {
            return Err(UniverseError::generation(format!(
                "unpack of {} requires a sha256",
                step.url
            )));
        }
        let key = step.sha256.to_lowercase();
        if let Some(p) = self.cache.by_name(&key) {
            return std::fs::read(&p).map_err(|e| UniverseError::io(p, e));
        }
        let data = deb::download(&step.url)?;
        deb::verify_sha256(&data, &step.sha256)?;
        self.cache.put_named(&key, &data)?;
        Ok(data)
    }

    fn configure(&self, step: &BuildStep) -> UniverseResult<()> {
        let wd = self.in_root(&step.dir);
        let program = if step.path.is_empty() {
            wd.join("configure").display().to_string()
        } else {
            step.path.clone()
        };
        let mut named: Vec<_> = step.named_args.iter().collect();
        named.sort();
        let mut args: Vec<String> = named
            .into_iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    format!("--{}", k)
                } else {
                    format!("--{}={}", k, v)
                }
            })
            .collect();
        args.extend(step.args.iter().cloned());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        shell::run(&program, &args, &wd, &self.envs)?.into_result("configure")?;
        Ok(())
    }
}

impl BuildEnv for LocalEnv {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn run_step(&mut self, step: &BuildStep) -> UniverseResult<()> {
        let start = Instant::now();
        match step.kind {
            StepKind::UnpackGz => self.unpack(step)?,
            StepKind::ShellCmd => {
                let cmd = step.args.first().map(String::as_str).unwrap_or_default();
                shell::sh(cmd, self.dir.path(), &self.envs)?.into_result("shell command")?;
            }
            StepKind::Configure => self.configure(step)?,
            StepKind::Write => {
                let dest = self.in_root(&step.to_path);
                crate::runner::ensure_parent(&dest)?;
                let body = step.args.first().map(String::as_str).unwrap_or_default();
                std::fs::write(&dest, body).map_err(|e| UniverseError::io(&dest, e))?;
            }
        }
        debug!(step = %step.kind, elapsed_ms = start.elapsed().as_millis() as u64, "step finished");
        Ok(())
    }

    fn close(self: Box<Self>) -> UniverseResult<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| UniverseError::io(path, e))
    }
}

/// Walk `root` and keep every file or symlink whose relative path matches
/// one of `rules`, stored under the mapped name. Whiteout markers (`.wh.*`)
/// are skipped. With no rules the whole tree is kept.
pub fn capture_outputs(root: &Path, rules: &FilenameRules) -> UniverseResult<Fileset> {
    let mut out = Fileset::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            UniverseError::generation(format!("walking build output: {}", e))
        })?;
        let ft = entry.file_type();
        if ft.is_dir() || entry.file_name().to_string_lossy().starts_with(".wh.") {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| UniverseError::generation(e.to_string()))?
            .to_string_lossy()
            .to_string();
        let name = if rules.is_empty() {
            rel
        } else {
            match rules.match_path(&rel) {
                Some(mapped) => mapped,
                None => continue,
            }
        };
        if ft.is_symlink() {
            let link = std::fs::read_link(entry.path())
                .map_err(|e| UniverseError::io(entry.path(), e))?;
            out.push(FileEntry::symlink(&name, link.to_string_lossy()));
        } else {
            let meta = std::fs::metadata(entry.path())
                .map_err(|e| UniverseError::io(entry.path(), e))?;
            let data = std::fs::read(entry.path()).map_err(|e| UniverseError::io(entry.path(), e))?;
            out.push(FileEntry::file(&name, file_mode(&meta), data));
        }
    }
    Ok(out)
}

/// Run every step of `build` in `env`, logging progress.
pub fn run_steps(build: &Build, env: &mut dyn BuildEnv) -> UniverseResult<()> {
    let start = Instant::now();
    for (i, step) in build.steps.iter().enumerate() {
        env.run_step(step).map_err(|e| {
            let e = UniverseError::generation(format!(
                "step {} ({}) failed: {}",
                i + 1,
                step.kind,
                e
            ));
            match &step.pos {
                Some(pos) => e.with_position(pos.clone()),
                None => e,
            }
        })?;
    }
    info!(build = %build.path, steps = build.steps.len(), elapsed_ms = start.elapsed().as_millis() as u64, "build finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::OutputMapper;
    use pretty_assertions::assert_eq;

    fn build_with(steps: Vec<BuildStep>, rules: FilenameRules) -> Build {
        Build {
            path: "//t:b".into(),
            name: "b".into(),
            steps,
            output: rules,
            ..Default::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_step_writes_into_root() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(cache_dir.path()).unwrap();
        let rules = FilenameRules::new([("/usr/bin/*", OutputMapper::StripPrefix(String::new()))]).unwrap();
        let build = build_with(
            vec![BuildStep::shell(
                "mkdir -p usr/bin && printf hi > usr/bin/app && touch usr/bin/.wh.gone",
            )],
            rules,
        );
        let mut env = LocalExecutor::new().new_env(&build, &cache).unwrap();
        run_steps(&build, env.as_mut()).unwrap();
        let out = capture_outputs(env.root(), &build.output).unwrap();
        env.close().unwrap();

        let paths: Vec<&str> = out.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["usr/bin/app"]);
        assert_eq!(out.find("usr/bin/app").unwrap().data, b"hi");
    }

    #[test]
    fn test_write_step_and_literal_mapping() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(cache_dir.path()).unwrap();
        let mut write = BuildStep::new(StepKind::Write);
        write.to_path = "/etc/motd".into();
        write.args.push("welcome\n".into());
        let rules = FilenameRules::new([("/etc/motd", OutputMapper::Literal("etc/issue".into()))]).unwrap();
        let build = build_with(vec![write], rules);

        let mut env = LocalExecutor::new().new_env(&build, &cache).unwrap();
        run_steps(&build, env.as_mut()).unwrap();
        let out = capture_outputs(env.root(), &build.output).unwrap();
        assert_eq!(out.find("etc/issue").unwrap().data, b"welcome\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_step_reports_index() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(cache_dir.path()).unwrap();
        let build = build_with(
            vec![BuildStep::shell("true"), BuildStep::shell("exit 3")],
            FilenameRules::default(),
        );
        let mut env = LocalExecutor::new().new_env(&build, &cache).unwrap();
        let err = run_steps(&build, env.as_mut()).unwrap_err();
        assert!(err.to_string().contains("step 2 (shell_cmd) failed"), "{}", err);
    }

    #[test]
    fn test_unpack_from_contract_dir() {
        let contract = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(cache_dir.path()).unwrap();
        let tarball: Fileset = [FileEntry::file("src/main.c", 0o644, b"int main;".to_vec())]
            .into_iter()
            .collect();
        std::fs::write(
            contract.path().join("src.tar.gz"),
            tarball.write_tar_gz(Vec::new()).unwrap(),
        )
        .unwrap();

        let mut unpack = BuildStep::new(StepKind::UnpackGz);
        unpack.path = "src.tar.gz".into();
        unpack.to_path = "/build".into();
        let mut build = build_with(vec![unpack], FilenameRules::default());
        build.contract_dir = contract.path().to_path_buf();

        let mut env = LocalExecutor::new().new_env(&build, &cache).unwrap();
        run_steps(&build, env.as_mut()).unwrap();
        let out = capture_outputs(env.root(), &build.output).unwrap();
        assert_eq!(out.find("build/src/main.c").unwrap().data, b"int main;");
    }
}

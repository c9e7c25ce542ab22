//! Declared build steps.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use super::DefPosition;
use crate::error::{UniverseError, UniverseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Extract a gzip-compressed tarball into the build root.
    UnpackGz,
    /// Run one shell command.
    #[serde(alias = "bash_cmd")]
    ShellCmd,
    /// Run `./configure` with named arguments as `--key=value` flags.
    Configure,
    /// Write the single argument into a file.
    Write,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepKind::UnpackGz => "unpack_gz",
            StepKind::ShellCmd => "shell_cmd",
            StepKind::Configure => "configure",
            StepKind::Write => "write",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    pub kind: StepKind,
    pub pos: Option<DefPosition>,
    pub to_path: String,
    pub path: String,
    pub url: String,
    pub sha256: String,
    pub dir: String,
    pub args: Vec<String>,
    pub named_args: HashMap<String, String>,
}

impl BuildStep {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            pos: None,
            to_path: String::new(),
            path: String::new(),
            url: String::new(),
            sha256: String::new(),
            dir: String::new(),
            args: Vec::new(),
            named_args: HashMap::new(),
        }
    }

    pub fn shell(cmd: impl Into<String>) -> Self {
        let mut step = Self::new(StepKind::ShellCmd);
        step.args.push(cmd.into());
        step
    }

    pub fn validate(&self) -> UniverseResult<()> {
        match self.kind {
            StepKind::UnpackGz => {
                if self.path.is_empty() && self.url.is_empty() {
                    return Err(UniverseError::validation(
                        "unpack_gz step requires a path or url",
                    ));
                }
                if self.to_path.is_empty() || self.to_path == "/" {
                    return Err(UniverseError::validation(
                        "unpack_gz step cannot unpack to the root directory",
                    ));
                }
            }
            StepKind::ShellCmd => {
                if self.args.len() != 1 {
                    return Err(UniverseError::validation(format!(
                        "shell_cmd step requires exactly one argument, got {}",
                        self.args.len()
                    )));
                }
            }
            StepKind::Configure => {
                if self.dir.is_empty() {
                    return Err(UniverseError::validation("configure step requires a dir"));
                }
            }
            StepKind::Write => {
                if self.to_path.is_empty() {
                    return Err(UniverseError::validation(
                        "write step requires a destination path",
                    ));
                }
                if self.args.len() > 1 {
                    return Err(UniverseError::validation(
                        "write step takes at most one argument",
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn rollup_hash(&self) -> Vec<u8> {
        let mut h = Sha256::new();
        h.update(format!("step: {}\n", self.kind).as_bytes());
        h.update(format!("to_path: {:?}\n", self.to_path).as_bytes());
        h.update(format!("path: {:?}\n", self.path).as_bytes());
        h.update(format!("url: {:?}\n", self.url).as_bytes());
        h.update(format!("sha256: {:?}\n", self.sha256).as_bytes());
        h.update(format!("dir: {:?}\n", self.dir).as_bytes());
        for arg in &self.args {
            h.update(format!("arg: {:?}\n", arg).as_bytes());
        }
        let mut named: Vec<_> = self.named_args.iter().collect();
        named.sort();
        for (k, v) in named {
            h.update(format!("named[{:?}] = {:?}\n", k, v).as_bytes());
        }
        h.finalize().to_vec()
    }
}

//! Running shell commands for computed values and build steps.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{UniverseError, UniverseResult};

/// Result of one shell invocation.
#[derive(Debug)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output, for error messages
    pub fn output(&self) -> String {
        let mut output = String::new();
        if !self.stdout.is_empty() {
            output.push_str("STDOUT:\n");
            output.push_str(&self.stdout);
            output.push('\n');
        }
        if !self.stderr.is_empty() {
            output.push_str("STDERR:\n");
            output.push_str(&self.stderr);
        }
        output
    }

    /// Fail unless the command exited with status 0.
    pub fn into_result(self, what: &str) -> UniverseResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(UniverseError::generation(format!(
                "{} exited with status {}\n{}",
                what,
                self.exit_code,
                self.output()
            )))
        }
    }
}

/// Run `program args..` in `cwd` with extra environment variables.
pub fn run(
    program: &str,
    args: &[&str],
    cwd: &Path,
    envs: &HashMap<String, String>,
) -> UniverseResult<ShellOutput> {
    let start = Instant::now();
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| UniverseError::io(cwd, e))?
        .wait_with_output()
        .map_err(|e| UniverseError::io(cwd, e))?;

    Ok(ShellOutput {
        exit_code: output.status.code().unwrap_or(1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        elapsed: start.elapsed(),
    })
}

/// Run a snippet through `sh -c`.
pub fn sh(command: &str, cwd: &Path, envs: &HashMap<String, String>) -> UniverseResult<ShellOutput> {
    run("sh", &["-c", command], cwd, envs)
}

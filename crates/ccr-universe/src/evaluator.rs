//! Evaluation of computed attribute values.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use crate::error::{UniverseError, UniverseResult};
use crate::runner::RunnerEnv;
use crate::shell;
use crate::target::{Attr, ComputedValue, Target, Value};

/// Turns a [`ComputedValue`] into a literal. The universe calls this wherever
/// an attribute's value is needed: path indexing, hashing and population.
pub trait AttrEvaluator: Send + Sync {
    fn evaluate(
        &self,
        attr: &Attr,
        owner: Option<&Target>,
        computed: &ComputedValue,
        env: &RunnerEnv,
    ) -> UniverseResult<Value>;
}

/// Evaluates computed values with `sh`.
///
/// Inline values run as a snippet; `file`/`func` values source the script
/// (relative to the defining contract directory) and call the function.
/// Standard output is trimmed and read as an integer, a boolean, or else a
/// string. The snippet sees `CCR_BASE_DIR`, `CCR_ATTR` and `CCR_TARGET`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandEvaluator;

impl AttrEvaluator for CommandEvaluator {
    fn evaluate(
        &self,
        attr: &Attr,
        owner: Option<&Target>,
        computed: &ComputedValue,
        env: &RunnerEnv,
    ) -> UniverseResult<Value> {
        let cwd: PathBuf = if computed.contract_dir.is_dir() {
            computed.contract_dir.clone()
        } else {
            env.dir.clone()
        };

        let mut vars = HashMap::new();
        vars.insert("CCR_BASE_DIR".to_string(), env.dir.display().to_string());
        vars.insert("CCR_ATTR".to_string(), attr.name.clone());
        if let Some(path) = owner.and_then(|o| o.global_path()) {
            vars.insert("CCR_TARGET".to_string(), path.to_string());
        }

        debug!(value = %computed, cwd = %cwd.display(), "evaluating computed value");

        let out = if !computed.inline.is_empty() {
            shell::sh(&computed.inline, &cwd, &vars)?
        } else {
            let script = computed.contract_dir.join(&computed.file);
            let script = script.to_string_lossy();
            shell::run(
                "sh",
                &["-c", ". \"$0\" && \"$1\"", &*script, computed.func.as_str()],
                &cwd,
                &vars,
            )?
        };

        if !out.success() {
            return Err(UniverseError::validation(format!(
                "computed value exited with status {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(parse_output(out.stdout.trim()))
    }
}

fn parse_output(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        return Value::Int(i);
    }
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(s.to_string()),
    }
}

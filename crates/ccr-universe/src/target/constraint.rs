//! Comparison constraints carried on edges.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use super::{TargetRef, Value};
use crate::error::{UniverseError, UniverseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    /// Compare `left op right`.
    ///
    /// Strings that both parse as semantic versions are compared as versions.
    /// Booleans only support equality.
    pub fn evaluate(&self, left: &Value, right: &Value) -> UniverseResult<bool> {
        let ordering = match (left, right) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => {
                match (parse_version(a), parse_version(b)) {
                    (Some(va), Some(vb)) => va.cmp(&vb),
                    _ => a.cmp(b),
                }
            }
            (Value::Bool(a), Value::Bool(b)) => {
                return match self {
                    CompareOp::Eq => Ok(a == b),
                    CompareOp::Ne => Ok(a != b),
                    _ => Err(UniverseError::Constraint(format!(
                        "operator {} is not defined on booleans",
                        self.as_str()
                    ))),
                }
            }
            (l, r) => {
                return Err(UniverseError::Constraint(format!(
                    "cannot compare {} with {}",
                    l.type_name(),
                    r.type_name()
                )))
            }
        };

        Ok(match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        })
    }
}

fn parse_version(s: &str) -> Option<semver::Version> {
    semver::Version::parse(s.trim_start_matches('v')).ok()
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompareOp {
    type Err = UniverseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "==" => Ok(CompareOp::Eq),
            "!=" => Ok(CompareOp::Ne),
            "<" => Ok(CompareOp::Lt),
            "<=" => Ok(CompareOp::Le),
            ">" => Ok(CompareOp::Gt),
            ">=" => Ok(CompareOp::Ge),
            other => Err(UniverseError::Constraint(format!(
                "unknown comparison operator {:?}",
                other
            ))),
        }
    }
}

/// `class op value`: the referenced target's attribute of `class` must
/// compare true against `value`.
#[derive(Debug, Clone)]
pub struct RefConstraint {
    pub class: TargetRef,
    pub op: CompareOp,
    pub value: Value,
}

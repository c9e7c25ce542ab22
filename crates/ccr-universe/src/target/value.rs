//! Attribute values: literals and lazily computed values.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

use super::DefPosition;

/// A literal attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    String(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::String(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// A value computed on demand by the attribute evaluator.
///
/// Either `inline` holds a shell snippet, or `file`/`func` name a script
/// relative to the defining contract directory and the function to invoke.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComputedValue {
    pub pos: Option<DefPosition>,
    pub contract_dir: PathBuf,
    pub file: String,
    pub func: String,
    pub inline: String,
    pub read_write: bool,
}

impl ComputedValue {
    pub fn inline(code: impl Into<String>) -> Self {
        Self {
            inline: code.into(),
            ..Default::default()
        }
    }

    pub fn from_file(file: impl Into<String>, func: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            func: func.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for ComputedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.inline.is_empty() {
            let digest = Sha256::digest(self.inline.as_bytes());
            return write!(f, "computed_value<0x{}>", hex::encode(&digest[..4]));
        }
        write!(f, "computed_value<{}, {}>", self.file, self.func)
    }
}

/// What an attribute node carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Literal(Value),
    Computed(ComputedValue),
}

impl AttrValue {
    pub fn computed(&self) -> Option<&ComputedValue> {
        match self {
            AttrValue::Computed(cv) => Some(cv),
            AttrValue::Literal(_) => None,
        }
    }
}

impl From<Value> for AttrValue {
    fn from(v: Value) -> Self {
        AttrValue::Literal(v)
    }
}

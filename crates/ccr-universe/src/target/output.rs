//! Filename rules: which files a build or sieve keeps, and under what name.

use globset::{Glob, GlobMatcher};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{UniverseError, UniverseResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMapper {
    /// Replace the matched path with a fixed one.
    Literal(String),
    /// Drop a leading prefix from the matched path.
    StripPrefix(String),
}

impl OutputMapper {
    pub fn map(&self, path: &str) -> String {
        match self {
            OutputMapper::Literal(out) => out.clone(),
            OutputMapper::StripPrefix(prefix) => {
                path.strip_prefix(prefix.as_str()).unwrap_or(path).to_string()
            }
        }
    }
}

impl fmt::Display for OutputMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMapper::Literal(p) => write!(f, "literal<{:?}>", p),
            OutputMapper::StripPrefix(p) => write!(f, "strip_prefix_mapper<{:?}>", p),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    matcher: GlobMatcher,
    mapper: OutputMapper,
}

/// Ordered glob rules. Patterns are kept sorted and the first match wins.
#[derive(Debug, Clone, Default)]
pub struct FilenameRules {
    rules: Vec<Rule>,
}

impl FilenameRules {
    pub fn new<I, S>(rules: I) -> UniverseResult<Self>
    where
        I: IntoIterator<Item = (S, OutputMapper)>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for (pattern, mapper) in rules {
            let pattern = pattern.as_ref().trim_start_matches('/').to_string();
            let glob = Glob::new(&pattern).map_err(|e| {
                UniverseError::validation(format!("compiling glob {:?}: {}", pattern, e))
            })?;
            compiled.push(Rule {
                pattern,
                matcher: glob.compile_matcher(),
                mapper,
            });
        }
        compiled.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        Ok(Self { rules: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The mapped name for `path`, or `None` if no rule matches.
    pub fn match_path(&self, path: &str) -> Option<String> {
        let path = path.trim_start_matches('/');
        self.rules
            .iter()
            .find(|r| r.matcher.is_match(path))
            .map(|r| r.mapper.map(path))
    }

    pub fn rollup_hash(&self) -> Vec<u8> {
        let mut h = Sha256::new();
        h.update(b"Output mappings:\n");
        for rule in &self.rules {
            h.update(format!("{}: {}\n", rule.pattern, rule.mapper).as_bytes());
        }
        h.finalize().to_vec()
    }
}

impl fmt::Display for FilenameRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FilenameRules{")?;
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}: {}", rule.pattern, rule.mapper)?;
        }
        f.write_str("}")
    }
}

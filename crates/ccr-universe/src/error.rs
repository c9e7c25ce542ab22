/// Universe error types
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::target::{DefPosition, TargetType};

pub type UniverseResult<T> = Result<T, UniverseError>;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("universe must be built first")]
    NotBuilt,

    #[error("target {0:?} does not exist")]
    NotExists(String),

    #[error("resolving {path:?}: {message}")]
    Resolve { path: String, message: String },

    #[error("definition error in {file}: {message}")]
    Definition { file: PathBuf, message: String },

    #[error("constraint could not be evaluated: {0}")]
    Constraint(String),

    #[error("{0}")]
    Validation(String),

    #[error("{message}")]
    CircularDependency { message: String, chain: Vec<String> },

    #[error("dependency cycle between {kind} targets: {}", members.join(", "))]
    DependencyCycle {
        kind: TargetType,
        members: Vec<String>,
    },

    #[error("cannot compute rollup hash on non-reproducible target of type {0}")]
    NonReproducible(TargetType),

    #[error("{message}")]
    CheckFailed {
        message: String,
        constraint: Option<FailingConstraint>,
    },

    #[error("{0}")]
    Generation(String),

    #[error("max resolution iterations were reached ({iterations}) with {pending} targets pending")]
    SchedulerStall { iterations: usize, pending: usize },

    #[error("cache miss")]
    CacheMiss,

    #[error("cache error: {0}")]
    Cache(String),

    #[error("I/O error at {path}: {error}")]
    IoError {
        path: PathBuf,
        error: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}", .0.error)]
    Wrapped(Box<WrappedError>),
}

/// Broad classification used by the command line to render diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    Resolution,
    Validation,
    CircularDependency,
    NonReproducible,
    CheckerFailure,
    Generation,
    Scheduler,
    Cache,
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::NotFound => "not-found",
            ErrorCategory::Resolution => "resolution",
            ErrorCategory::Validation => "validation",
            ErrorCategory::CircularDependency => "circular-dependency",
            ErrorCategory::NonReproducible => "non-reproducible",
            ErrorCategory::CheckerFailure => "checker-failure",
            ErrorCategory::Generation => "generation",
            ErrorCategory::Scheduler => "scheduler",
            ErrorCategory::Cache => "cache",
            ErrorCategory::Io => "io",
        };
        f.write_str(s)
    }
}

/// The comparison a checker found to be false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailingConstraint {
    pub left: String,
    pub op: String,
    pub right: String,
}

impl fmt::Display for FailingConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.left, self.op, self.right)
    }
}

/// An error annotated with where in the graph it happened.
#[derive(Debug)]
pub struct WrappedError {
    pub error: UniverseError,
    pub target: Option<String>,
    pub action_target: Option<String>,
    pub chain: Vec<String>,
    pub path: Option<PathBuf>,
    pub pos: Option<DefPosition>,
    pub computed_value: Option<String>,
}

impl WrappedError {
    fn new(error: UniverseError) -> Self {
        Self {
            error,
            target: None,
            action_target: None,
            chain: Vec::new(),
            path: None,
            pos: None,
            computed_value: None,
        }
    }
}

impl UniverseError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        UniverseError::Validation(msg.into())
    }

    /// Create a generation error
    pub fn generation(msg: impl Into<String>) -> Self {
        UniverseError::Generation(msg.into())
    }

    /// Create a checker failure without a constraint
    pub fn check_failed(msg: impl Into<String>) -> Self {
        UniverseError::CheckFailed {
            message: msg.into(),
            constraint: None,
        }
    }

    /// Create a resolution error
    pub fn resolve(path: impl Into<String>, msg: impl ToString) -> Self {
        UniverseError::Resolve {
            path: path.into(),
            message: msg.to_string(),
        }
    }

    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        UniverseError::IoError {
            path: path.into(),
            error,
        }
    }

    /// The innermost error, with all context wrappers removed.
    pub fn root_cause(&self) -> &UniverseError {
        match self {
            UniverseError::Wrapped(w) => w.error.root_cause(),
            other => other,
        }
    }

    /// Context recorded while the error propagated, if any.
    pub fn context(&self) -> Option<&WrappedError> {
        match self {
            UniverseError::Wrapped(w) => Some(w),
            _ => None,
        }
    }

    pub fn is_not_exists(&self) -> bool {
        matches!(self.root_cause(), UniverseError::NotExists(_))
    }

    pub fn is_cache_miss(&self) -> bool {
        matches!(self.root_cause(), UniverseError::CacheMiss)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            UniverseError::Wrapped(w) => w.error.category(),
            UniverseError::NotExists(_) => ErrorCategory::NotFound,
            UniverseError::Resolve { .. }
            | UniverseError::Definition { .. }
            | UniverseError::Constraint(_) => ErrorCategory::Resolution,
            UniverseError::NotBuilt | UniverseError::Validation(_) => ErrorCategory::Validation,
            UniverseError::CircularDependency { .. } | UniverseError::DependencyCycle { .. } => {
                ErrorCategory::CircularDependency
            }
            UniverseError::NonReproducible(_) => ErrorCategory::NonReproducible,
            UniverseError::CheckFailed { .. } => ErrorCategory::CheckerFailure,
            UniverseError::Generation(_) => ErrorCategory::Generation,
            UniverseError::SchedulerStall { .. } => ErrorCategory::Scheduler,
            UniverseError::CacheMiss | UniverseError::Cache(_) => ErrorCategory::Cache,
            UniverseError::IoError { .. } | UniverseError::Io(_) => ErrorCategory::Io,
        }
    }

    /// The failing constraint carried by a checker failure.
    pub fn failing_constraint(&self) -> Option<&FailingConstraint> {
        match self.root_cause() {
            UniverseError::CheckFailed { constraint, .. } => constraint.as_ref(),
            _ => None,
        }
    }

    fn wrapped(self) -> Box<WrappedError> {
        match self {
            UniverseError::Wrapped(w) => w,
            other => Box::new(WrappedError::new(other)),
        }
    }

    /// Record the target the error happened in. The first target becomes the
    /// offending target, later distinct targets are appended to the chain.
    pub fn with_target(self, label: impl Into<String>) -> Self {
        let label = label.into();
        let mut w = self.wrapped();
        match &w.target {
            None => w.target = Some(label),
            Some(current) if *current == label => {}
            Some(_) => {
                if w.chain.last() != Some(&label) {
                    w.chain.push(label);
                }
            }
        }
        UniverseError::Wrapped(w)
    }

    /// Record the checker or generator that was running. Only the innermost
    /// action target is kept.
    pub fn with_action_target(self, label: impl Into<String>) -> Self {
        let mut w = self.wrapped();
        if w.action_target.is_none() {
            w.action_target = Some(label.into());
        }
        UniverseError::Wrapped(w)
    }

    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        let mut w = self.wrapped();
        w.path = Some(path.into());
        UniverseError::Wrapped(w)
    }

    pub fn with_position(self, pos: DefPosition) -> Self {
        let mut w = self.wrapped();
        w.pos = Some(pos);
        UniverseError::Wrapped(w)
    }

    pub fn with_computed_value(self, descriptor: impl Into<String>) -> Self {
        let mut w = self.wrapped();
        w.computed_value = Some(descriptor.into());
        UniverseError::Wrapped(w)
    }
}

//! Error types for reconciliation runs.
//!
//! Errors fall into three phases. Configuration errors abort a run before any
//! side effect happens, execution errors are isolated to the node that raised
//! them, and state errors come from the store (locking, persistence).

use std::path::PathBuf;
use thiserror::Error;

/// Phase an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Detected while loading, resolving, building or planning
    Configuration,
    /// Raised by a node's side effect or lifecycle hook
    Execution,
    /// Raised by the state store
    State,
    /// Anything else (IO, serialization)
    Other,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::State)
    }

    /// Whether errors of this category abort a run before any side effect.
    pub fn is_fatal_before_apply(&self) -> bool {
        matches!(self, Self::Configuration)
    }
}

/// Errors raised by the reconciliation engine.
///
/// Messages name the originating node or variable. Values of variables are
/// never embedded, so sensitive data cannot leak through error text.
#[derive(Debug, Error)]
pub enum Error {
    /// No source supplied a value and the declaration has no default
    #[error("no value for required variable `{name}`")]
    MissingVariable {
        /// Variable name
        name: String,
    },

    /// Resolved value does not conform to the declared type
    #[error("variable `{name}`: expected {expected}, found {found}")]
    TypeMismatch {
        /// Variable name, with a path suffix for nested elements
        name: String,
        /// Declared type
        expected: String,
        /// Kind of value actually supplied
        found: String,
    },

    /// A validation rule rejected the resolved value
    #[error("variable `{name}` failed validation: {message}")]
    ValidationFailed {
        /// Variable name
        name: String,
        /// Configured error message
        message: String,
    },

    /// An expression or `depends_on` entry names something that is not declared
    #[error("{node}: reference to undeclared `{reference}`")]
    UnknownReference {
        /// Node (or output) holding the reference
        node: String,
        /// The unresolved reference
        reference: String,
    },

    /// The dependency graph contains a cycle
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// Participating node identifiers in cycle order
        cycle: Vec<String>,
    },

    /// Planning would destroy a node protected by `prevent_destroy`
    #[error("{node}: lifecycle.prevent_destroy forbids destroying this node")]
    DestroyForbidden {
        /// Protected node
        node: String,
    },

    /// Another run holds the state lock
    #[error("state is locked by {holder} (lock id {lock_id}, operation {operation})")]
    StateLocked {
        /// Who holds the lock
        holder: String,
        /// Lock identifier, usable with force-unlock
        lock_id: String,
        /// Operation the holder is running
        operation: String,
    },

    /// A node's primary side effect failed
    #[error("{node}: {message}")]
    SideEffectFailure {
        /// Node whose action failed
        node: String,
        /// Cause reported by the provider
        message: String,
    },

    /// A lifecycle hook failed
    #[error("{node}: {hook} hook failed: {message}")]
    HookFailure {
        /// Node owning the hook
        node: String,
        /// Hook kind (`local-exec`, `remote-exec`, `file`)
        hook: String,
        /// Cause reported by the hook runner
        message: String,
    },

    /// Malformed configuration
    #[error("{origin}: {message}")]
    Config {
        /// File or declaration the problem was found in
        origin: String,
        /// Description of the problem
        message: String,
    },

    /// A node, variable or output is declared twice
    #[error("`{name}` is declared more than once")]
    DuplicateDeclaration {
        /// Duplicated name
        name: String,
    },

    /// A type expression could not be parsed
    #[error("invalid type expression `{expr}`: {reason}")]
    InvalidType {
        /// Offending expression
        expr: String,
        /// What is wrong with it
        reason: String,
    },

    /// A `${...}` interpolation could not be parsed
    #[error("invalid reference `{expr}`: {reason}")]
    InvalidReference {
        /// Offending expression
        expr: String,
        /// What is wrong with it
        reason: String,
    },

    /// No provider is registered for a node type
    #[error("{node}: no provider registered for type `{node_type}`")]
    UnknownProvider {
        /// Node needing the provider
        node: String,
        /// Its type
        node_type: String,
    },

    /// force-unlock was given the wrong lock id
    #[error("lock id `{given}` does not match the held lock `{held}`")]
    LockMismatch {
        /// Id supplied by the caller
        given: String,
        /// Id of the lock actually held
        held: String,
    },

    /// IO error on a known path
    #[error("IO error at {}: {source}", .path.display())]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The executor's worker pool could not be started
    #[error("failed to create thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// TOML parse error
    #[error("failed to parse {}: {source}", .path.display())]
    Toml {
        /// File being parsed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::MissingVariable { .. }
            | Error::TypeMismatch { .. }
            | Error::ValidationFailed { .. }
            | Error::UnknownReference { .. }
            | Error::CyclicDependency { .. }
            | Error::DestroyForbidden { .. }
            | Error::Config { .. }
            | Error::DuplicateDeclaration { .. }
            | Error::InvalidType { .. }
            | Error::InvalidReference { .. }
            | Error::Toml { .. } => ErrorCategory::Configuration,
            Error::SideEffectFailure { .. }
            | Error::HookFailure { .. }
            | Error::UnknownProvider { .. } => ErrorCategory::Execution,
            Error::StateLocked { .. } => ErrorCategory::State,
            Error::LockMismatch { .. }
            | Error::Io { .. }
            | Error::Json(_)
            | Error::ThreadPool(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    ///
    /// Only a held state lock qualifies: the holder may finish at any moment.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Node identifier the error originated from, when there is one.
    pub fn node(&self) -> Option<&str> {
        match self {
            Error::UnknownReference { node, .. }
            | Error::DestroyForbidden { node }
            | Error::SideEffectFailure { node, .. }
            | Error::HookFailure { node, .. }
            | Error::UnknownProvider { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Build a closure that wraps an IO error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Error::Io { path, source }
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_state_lock_is_retryable() {
        let locked = Error::StateLocked {
            holder: "ci@host".into(),
            lock_id: "abc".into(),
            operation: "apply".into(),
        };
        assert!(locked.is_retryable());
        assert!(!Error::MissingVariable { name: "x".into() }.is_retryable());
        assert!(
            !Error::SideEffectFailure {
                node: "a.b".into(),
                message: "boom".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_configuration_errors_are_fatal_before_apply() {
        let err = Error::CyclicDependency {
            cycle: vec!["a.x".into(), "b.y".into(), "a.x".into()],
        };
        assert!(err.category().is_fatal_before_apply());
        assert_eq!(err.to_string(), "dependency cycle: a.x -> b.y -> a.x");

        let err = Error::HookFailure {
            node: "a.x".into(),
            hook: "local-exec".into(),
            message: "exit 1".into(),
        };
        assert!(!err.category().is_fatal_before_apply());
        assert_eq!(err.node(), Some("a.x"));
    }
}

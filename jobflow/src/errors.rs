//! Error types for the jobflow runtime.
//!
//! The taxonomy follows the runtime's failure surfaces: configuration
//! errors are fatal to the caller, transform errors are routed, and
//! cancellation is carried as a cause rather than treated as a failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancellation::ScopeError;

/// Convenience result alias for jobflow operations.
pub type Result<T, E = JobflowError> = std::result::Result<T, E>;

/// The main error type for jobflow operations.
#[derive(Debug, Error)]
pub enum JobflowError {
    /// Invalid configuration supplied at construction time.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A send was attempted on a closed queue.
    #[error("queue closed")]
    QueueClosed,

    /// A submission was rejected because the pool is draining or stopped.
    #[error("pool is shutting down")]
    ShuttingDown,

    /// The governing scope was cancelled or its deadline passed.
    #[error("{0}")]
    Scope(#[from] ScopeError),

    /// A transform panicked and the panic was recovered.
    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanic {
        /// Worker that was running the transform.
        worker_id: usize,
        /// Panic payload rendered as text.
        message: String,
    },

    /// A domain-level failure returned by user code.
    #[error("{0}")]
    Transform(#[from] TransformError),

    /// A worker, timer or queue could not be created at runtime.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An operation was invoked in a lifecycle state that forbids it.
    #[error("invalid state: expected {expected}, found {found}")]
    InvalidState {
        /// The state(s) the operation requires.
        expected: String,
        /// The state the component was in.
        found: String,
    },
}

impl JobflowError {
    /// Creates a resource exhaustion error.
    #[must_use]
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted(message.into())
    }

    /// Creates an invalid state error.
    #[must_use]
    pub fn invalid_state(expected: impl Into<String>, found: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            found: found.to_string(),
        }
    }

    /// Returns true if the error is a cancellation or deadline cause.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Scope(_))
    }
}

/// Error raised when a configuration value is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("invalid configuration for '{field}': {message}")]
pub struct ConfigError {
    /// The offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

const PANIC_KIND: &str = "panic";

/// A domain-level failure reported by a transform or job handler.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct TransformError {
    /// Short machine-readable kind chosen by the transform.
    pub kind: String,
    /// Human-readable detail.
    pub detail: String,
    /// Whether a retry policy may attempt the item again.
    pub retryable: bool,
}

impl TransformError {
    /// Creates a retryable transform error.
    #[must_use]
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
            retryable: true,
        }
    }

    /// Creates a transform error that retry policies must not repeat.
    #[must_use]
    pub fn permanent(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
            retryable: false,
        }
    }

    /// Creates the error recorded for a recovered panic.
    #[must_use]
    pub fn panic(message: impl Into<String>) -> Self {
        Self::permanent(PANIC_KIND, message)
    }

    /// Returns true if this error stands for a recovered panic.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        self.kind == PANIC_KIND
    }

    /// Creates the error recorded when a per-item deadline passes.
    #[must_use]
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new("deadline-exceeded", detail)
    }
}

impl From<anyhow::Error> for TransformError {
    fn from(err: anyhow::Error) -> Self {
        Self::new("error", format!("{err:#}"))
    }
}

/// Renders a recovered panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::new("min_workers", "must be at least 1");
        assert_eq!(
            err.to_string(),
            "invalid configuration for 'min_workers': must be at least 1"
        );
    }

    #[test]
    fn test_transform_error_retryable_flags() {
        assert!(TransformError::new("io", "reset").retryable);
        assert!(!TransformError::permanent("parse", "bad digit").retryable);
        assert!(!TransformError::panic("boom").retryable);
        assert!(TransformError::panic("boom").is_panic());
        assert!(!TransformError::new("io", "reset").is_panic());
    }

    #[test]
    fn test_transform_error_from_anyhow() {
        let err: TransformError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.kind, "error");
        assert!(err.detail.contains("disk full"));
    }

    #[test]
    fn test_jobflow_error_from_scope_error() {
        let err: JobflowError = ScopeError::DeadlineExceeded.into();
        assert!(err.is_cancellation());
        assert_eq!(err.to_string(), "deadline exceeded");
    }

    #[test]
    fn test_invalid_state_message() {
        let err = JobflowError::invalid_state("new", "running");
        assert_eq!(err.to_string(), "invalid state: expected new, found running");
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}

//! Error types for Moood.
//!
//! Library crates use [`MooodError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all Moood operations.
#[derive(Debug, thiserror::Error)]
pub enum MooodError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (invalid worker name, bad stored value, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON encoding or decoding failed outside a worker call.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Two registered workers share a name.
    #[error("duplicate worker name: {name}")]
    DuplicateWorkerName { name: String },

    /// Ingestion payload rejected before it reaches the store.
    #[error("malformed entry payload: {reason}")]
    MalformedEntryPayload { reason: String },

    /// A worker did not answer within the invocation timeout.
    #[error("worker {worker} timed out after {}ms", timeout.as_millis())]
    WorkerTimeout { worker: String, timeout: Duration },

    /// A worker failed, exited non-zero, or returned malformed output.
    #[error("worker {worker} failed: {reason}")]
    WorkerInvocationFailed { worker: String, reason: String },

    /// The whole Start→Persist sequence exceeded its deadline.
    #[error("execution for entry {entry_id} exceeded {}ms", timeout.as_millis())]
    ExecutionTimeout { entry_id: String, timeout: Duration },

    /// The persistence sink rejected the merged result.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, MooodError>;

impl MooodError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an ingestion payload error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEntryPayload {
            reason: reason.into(),
        }
    }

    /// Create a worker invocation failure.
    pub fn invocation(worker: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WorkerInvocationFailed {
            worker: worker.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors caused by the caller's input rather than by the pipeline.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::MalformedEntryPayload { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = MooodError::config("missing worker target");
        assert_eq!(err.to_string(), "config error: missing worker target");

        let err = MooodError::WorkerTimeout {
            worker: "asent".into(),
            timeout: Duration::from_secs(60),
        };
        assert_eq!(err.to_string(), "worker asent timed out after 60000ms");

        let err = MooodError::DuplicateWorkerName {
            name: "complexity".into(),
        };
        assert!(err.to_string().contains("complexity"));
    }

    #[test]
    fn only_payload_errors_are_client_errors() {
        assert!(MooodError::malformed("`entry` must not be empty").is_client_error());
        assert!(!MooodError::PersistenceFailure("disk full".into()).is_client_error());
        assert!(!MooodError::invocation("asent", "exit status 1").is_client_error());
    }
}

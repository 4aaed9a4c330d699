//! Error types for aimad
//!
//! This module defines the error handling strategy for the orchestrator. There
//! are two error types: `OrchestratorError` (main error enum) and `ConfigError`
//! (configuration-specific).
//!
//! ## Error Handling Philosophy
//!
//! Library code uses `crate::error::Result<T>` which returns `OrchestratorError`.
//! The daemon binary uses `anyhow::Result<T>` for top-level error handling. The
//! conversion happens at the binary boundary using `anyhow::Error::from` to
//! preserve error chains.
//!
//! ## Retry Awareness
//!
//! Errors implement `IsRetryable` to indicate whether an operation should be
//! retried. `Conflict` is deliberately NOT retryable: it means a row's state
//! moved under the caller, and the caller must re-read before deciding anything.
//! `StorageUnavailable` and retryable `Provider` errors may be re-attempted
//! with bounded backoff.
//!
//! ## When to Use Which Error
//!
//! - `Conflict`: a compare-and-set on a job/instance/assignment state failed
//! - `StorageUnavailable`: the backing store rejected or dropped the operation
//! - `QuotaExceeded`: an owner's cost projection crossed their ceiling
//! - `Provider`: a cloud adapter exhausted its retry budget or hit a fatal
//!   provider-side condition
//! - `Validation`: a submitted job spec or API parameter is malformed

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Conflict: {entity} {id} no longer in state {expected}")]
    Conflict {
        entity: &'static str,
        id: String,
        expected: String,
    },

    #[error("Not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Quota exceeded for {owner}: {reason}")]
    QuotaExceeded { owner: String, reason: String },

    #[error("Provider error: {provider} - {message}")]
    Provider {
        provider: String,
        message: String,
        retryable: bool,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Validation error: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("Retry budget exhausted after {attempts} attempts: {reason}")]
    RetriesExhausted {
        attempts: u32,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => OrchestratorError::NotFound {
                entity: "row",
                id: String::new(),
            },
            other => OrchestratorError::StorageUnavailable(other.to_string()),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown provider tag: {0}")]
    UnknownProvider(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Trait for determining if an error is retryable
///
/// Used by the retry policy to decide whether a failed operation should be
/// attempted again. `Conflict` and `Validation` fail immediately: retrying an
/// operation against state that moved, or input that cannot become valid,
/// wastes the caller's deadline.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for OrchestratorError {
    fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::StorageUnavailable(_) | OrchestratorError::Io(_) => true,
            OrchestratorError::Provider { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_not_retryable() {
        let err = OrchestratorError::Conflict {
            entity: "job",
            id: "abc".to_string(),
            expected: "queued".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn storage_unavailable_is_retryable() {
        let err = OrchestratorError::StorageUnavailable("connection reset".to_string());
        assert!(err.is_retryable());
    }

    #[test]
    fn provider_error_carries_classification() {
        let transient = OrchestratorError::Provider {
            provider: "runpod".to_string(),
            message: "502 bad gateway".to_string(),
            retryable: true,
            source: None,
        };
        let fatal = OrchestratorError::Provider {
            provider: "runpod".to_string(),
            message: "invalid credentials".to_string(),
            retryable: false,
            source: None,
        };
        assert!(transient.is_retryable());
        assert!(!fatal.is_retryable());
    }
}

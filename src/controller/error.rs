//! Error types for the controllers.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

use crate::client::DataGridError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Data grid server error
    #[error("Data grid error: {0}")]
    DataGrid(#[from] DataGridError),

    /// A resource that must exist was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency conflict on a write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec or a policy violation
    #[error("Validation error: {0}")]
    Validation(String),

    /// More resources match a key than the model allows
    #[error("Consistency violation: {0}")]
    Consistency(String),

    /// Payload received from the server could not be interpreted
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            Error::NotFound(_) => true,
            Error::DataGrid(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            Error::Conflict(_) => true,
            _ => false,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, conflicts and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::DataGrid(e) => e.is_transient(),
            Error::Transient(_) | Error::Conflict(_) => true,
            Error::Validation(_)
            | Error::Permanent(_)
            | Error::MissingField(_)
            | Error::Consistency(_)
            | Error::MalformedPayload(_)
            | Error::NotFound(_) => false,
            Error::Serialization(_) | Error::Yaml(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            // Non-retryable errors wait for a spec change
            Duration::from_secs(3600)
        }
    }

    /// Short machine-readable reason used in conditions and events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "KubernetesError",
            Error::DataGrid(_) => "DataGridError",
            Error::NotFound(_) => "NotFound",
            Error::Conflict(_) => "Conflict",
            Error::MissingField(_) | Error::Validation(_) => "ValidationFailed",
            Error::Consistency(_) => "ConsistencyViolation",
            Error::MalformedPayload(_) => "MalformedPayload",
            Error::Transient(_) => "TransientError",
            Error::Permanent(_) => "PermanentError",
            Error::Serialization(_) | Error::Yaml(_) => "SerializationError",
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

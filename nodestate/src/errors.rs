//! Error types for the node-state layer.
//!
//! Every failure is classified into one of a small set of [`ErrorKind`]s. The
//! kind decides what a caller may do with it: transient and conflict errors
//! are retried inside the component that produced them, everything else is
//! surfaced.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = NodeStateError> = std::result::Result<T, E>;

/// Classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input: cache key, artifact descriptor, duration label.
    Validation,
    /// Missing object, key or secret.
    NotFound,
    /// May be retried without caller involvement.
    Transient,
    /// Optimistic-concurrency failure on an update.
    Conflict,
    /// Anything else from a remote call.
    Permanent,
    /// The operation observed cancellation.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::Transient => write!(f, "transient"),
            Self::Conflict => write!(f, "conflict"),
            Self::Permanent => write!(f, "permanent"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The main error type for node-state operations.
#[derive(Debug, Error)]
pub enum NodeStateError {
    /// Invalid input.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A remote call failed with a wire or service error code.
    #[error("{0}")]
    Remote(#[from] RemoteError),

    /// The named resource does not exist.
    #[error("not found: {resource}")]
    NotFound {
        /// The missing resource.
        resource: String,
    },

    /// A resource-version check failed.
    #[error("conflict updating {resource}")]
    Conflict {
        /// The contended resource.
        resource: String,
    },

    /// A failure that is known to be retryable.
    #[error("transient error: {0}")]
    Transient(String),

    /// The driver or client does not support the operation.
    #[error("{operation} is not implemented")]
    NotImplemented {
        /// The unsupported operation.
        operation: String,
    },

    /// The operation was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error decorated with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<NodeStateError>,
    },

    /// Any other permanent failure.
    #[error("{0}")]
    Permanent(String),
}

impl NodeStateError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::new(message))
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(resource: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Creates a not-implemented error.
    #[must_use]
    pub fn not_implemented(operation: impl Into<String>) -> Self {
        Self::NotImplemented {
            operation: operation.into(),
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    /// Creates a remote error from a wire code and message.
    #[must_use]
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote(RemoteError::new(code, message))
    }

    /// Wraps the error with a description of the failed operation.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the kind of this error.
    ///
    /// Remote errors report [`ErrorKind::Permanent`]; whether a particular
    /// remote code may be retried is decided by the transient classifier.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Self::Context { source, .. } => source.kind(),
            Self::Remote(_)
            | Self::NotImplemented { .. }
            | Self::Serialization(_)
            | Self::Io(_)
            | Self::Permanent(_) => ErrorKind::Permanent,
        }
    }

    /// Returns the innermost error, skipping context decoration.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns the remote error, if the root cause is one.
    #[must_use]
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self.root() {
            Self::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    /// Returns true for not-found errors.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true for conflict errors.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert(
            "kind".to_string(),
            serde_json::Value::String(self.kind().to_string()),
        );
        map.insert(
            "message".to_string(),
            serde_json::Value::String(self.to_string()),
        );
        if let Some(remote) = self.as_remote() {
            map.insert(
                "code".to_string(),
                serde_json::Value::String(remote.code.clone()),
            );
            if let Some(status) = remote.status {
                map.insert("status".to_string(), serde_json::Value::from(status));
            }
        }
        map
    }
}

impl From<serde_json::Error> for NodeStateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for NodeStateError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            "RequestTimeout"
        } else if err.is_connect() {
            "RequestError"
        } else {
            "HttpError"
        };
        let mut remote = RemoteError::new(code, err.to_string());
        if let Some(status) = err.status() {
            remote = remote.with_status(status.as_u16());
        }
        Self::Remote(remote)
    }
}

/// Error raised when input fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// The error message.
    pub message: String,
    /// The offending field, when known.
    pub field: Option<String>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    /// Sets the offending field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// An error reported by a remote service or the transport underneath it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct RemoteError {
    /// Service or wire error code (`SlowDown`, `RequestTimeout`, ...).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status, when the error came with one.
    pub status: Option<u16>,
}

impl RemoteError {
    /// Creates a new remote error.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Sets the HTTP status.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(NodeStateError::validation("bad").kind(), ErrorKind::Validation);
        assert_eq!(NodeStateError::not_found("cm/x").kind(), ErrorKind::NotFound);
        assert_eq!(NodeStateError::conflict("cm/x").kind(), ErrorKind::Conflict);
        assert_eq!(NodeStateError::transient("reset").kind(), ErrorKind::Transient);
        assert_eq!(
            NodeStateError::remote("SlowDown", "slow").kind(),
            ErrorKind::Permanent
        );
        assert_eq!(
            NodeStateError::not_implemented("OpenStream").kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn test_context_preserves_kind() {
        let err = NodeStateError::not_found("bucket/key").context("loading artifact");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "loading artifact: not found: bucket/key");
    }

    #[test]
    fn test_as_remote_through_context() {
        let err = NodeStateError::remote("SlowDown", "please slow down").context("put");
        let remote = err.as_remote();
        assert_eq!(remote.map(|r| r.code.as_str()), Some("SlowDown"));
    }

    #[test]
    fn test_io_not_found_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(NodeStateError::from(io).kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_to_dict() {
        let err = NodeStateError::Remote(RemoteError::new("InternalError", "boom").with_status(500));
        let dict = err.to_dict();
        assert_eq!(dict["kind"], "permanent");
        assert_eq!(dict["code"], "InternalError");
        assert_eq!(dict["status"], 500);
    }

    #[test]
    fn test_validation_with_field() {
        let err = ValidationError::new("key too long").with_field("key");
        assert_eq!(err.field.as_deref(), Some("key"));
        assert_eq!(err.to_string(), "key too long");
    }
}

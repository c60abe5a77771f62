//! Classification of retryable object-store errors.

use crate::errors::{ErrorKind, NodeStateError, Result};
use regex::Regex;

/// Service and wire codes that may be retried.
pub const TRANSIENT_ERROR_CODES: &[&str] = &[
    "RequestError",
    "RequestTimeout",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "InternalError",
    "SlowDown",
    "ServiceUnavailable",
];

const NETWORK_MARKERS: &[&str] = &[
    "connection reset",
    "connection refused",
    "broken pipe",
    "temporary failure in name resolution",
    "i/o timeout",
];

/// Decides whether an error may be retried.
///
/// An error is transient if it is already classified as such, if it carries
/// one of [`TRANSIENT_ERROR_CODES`], if it is a connection-reset or
/// temporary DNS failure, or if its message matches the deployment pattern.
#[derive(Debug, Clone, Default)]
pub struct TransientClassifier {
    pattern: Option<Regex>,
}

impl TransientClassifier {
    /// Creates a classifier with no deployment pattern.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a classifier with an extra message pattern.
    pub fn with_pattern(pattern: Option<&str>) -> Result<Self> {
        let pattern = match pattern.filter(|p| !p.is_empty()) {
            Some(p) => Some(Regex::new(p).map_err(|e| {
                NodeStateError::validation(format!("invalid transient error pattern: {e}"))
            })?),
            None => None,
        };
        Ok(Self { pattern })
    }

    /// Returns true if `err` may be retried.
    #[must_use]
    pub fn is_transient(&self, err: &NodeStateError) -> bool {
        match err.kind() {
            ErrorKind::Transient => return true,
            ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::Conflict | ErrorKind::Cancelled => {
                return false
            }
            ErrorKind::Permanent => {}
        }

        if let Some(remote) = err.as_remote() {
            if TRANSIENT_ERROR_CODES.contains(&remote.code.as_str()) {
                return true;
            }
        }

        if let NodeStateError::Io(io) = err.root() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            ) {
                return true;
            }
        }

        let message = err.to_string();
        let lowered = message.to_ascii_lowercase();
        if NETWORK_MARKERS.iter().any(|m| lowered.contains(m)) {
            return true;
        }

        self.pattern.as_ref().is_some_and(|p| p.is_match(&message))
    }
}

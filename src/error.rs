//! Error types for Turnstile.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a gate refused to let a call through.
///
/// These are expected outcomes, not faults. Each variant carries enough
/// metadata to build a precise client-facing message.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// The rate limit for the key is exhausted.
    RateLimited {
        key: String,
        limit: u64,
        window_secs: u64,
        retry_after_secs: u64,
    },
    /// An identical submission was seen within the suppression interval.
    DuplicateSubmission {
        key: String,
        first_seen_ms: i64,
        retry_after_secs: u64,
        message: Option<String>,
    },
    /// An idempotent execution for the key is still in flight.
    InProgress { key: String, first_seen_ms: i64 },
    /// The key was already used with different request parameters.
    FingerprintMismatch { key: String, first_seen_ms: i64 },
    /// The previous execution failed and the failure is being replayed.
    PreviouslyFailed { key: String, error: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::RateLimited {
                limit,
                window_secs,
                retry_after_secs,
                ..
            } => write!(
                f,
                "rate limit of {} requests per {}s exceeded, retry after {}s",
                limit, window_secs, retry_after_secs
            ),
            Rejection::DuplicateSubmission {
                message: Some(message),
                ..
            } => f.write_str(message),
            Rejection::DuplicateSubmission {
                retry_after_secs, ..
            } => write!(
                f,
                "duplicate submission, retry after {}s",
                retry_after_secs
            ),
            Rejection::InProgress { key, first_seen_ms } => write!(
                f,
                "request {} is already being processed (since {})",
                key,
                format_millis(*first_seen_ms)
            ),
            Rejection::FingerprintMismatch { key, .. } => write!(
                f,
                "idempotency key {} was already used with different parameters",
                key
            ),
            Rejection::PreviouslyFailed { key, error } => {
                write!(f, "request {} previously failed: {}", key, error)
            }
        }
    }
}

/// Render epoch milliseconds as RFC 3339 for messages and logs.
pub fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// A gate denied the call
    #[error("Denied: {0}")]
    Denied(Rejection),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Redis errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A backend call exceeded its deadline
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record could not be interpreted
    #[error("Malformed record at {key}: {reason}")]
    MalformedRecord { key: String, reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error means the state store could not be used.
    ///
    /// Callers use this to pick fail-open or fail-closed behavior.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            TurnstileError::Backend(_)
                | TurnstileError::Redis(_)
                | TurnstileError::Timeout(_)
                | TurnstileError::Serialization(_)
                | TurnstileError::MalformedRecord { .. }
        )
    }

    /// Whether this error is an expected denial.
    pub fn is_denied(&self) -> bool {
        matches!(self, TurnstileError::Denied(_))
    }

    /// The rejection carried by a denial, if any.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            TurnstileError::Denied(rejection) => Some(rejection),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(e: config::ConfigError) -> Self {
        TurnstileError::Config(e.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failure_classification() {
        assert!(TurnstileError::Backend("down".into()).is_backend_failure());
        assert!(TurnstileError::Timeout(Duration::from_millis(50)).is_backend_failure());
        assert!(TurnstileError::MalformedRecord {
            key: "k".into(),
            reason: "bad json".into()
        }
        .is_backend_failure());
        assert!(!TurnstileError::Config("bad".into()).is_backend_failure());

        let denied = TurnstileError::Denied(Rejection::InProgress {
            key: "k".into(),
            first_seen_ms: 0,
        });
        assert!(denied.is_denied());
        assert!(!denied.is_backend_failure());
    }

    #[test]
    fn test_rate_limited_message() {
        let rejection = Rejection::RateLimited {
            key: "rl:orders".into(),
            limit: 5,
            window_secs: 30,
            retry_after_secs: 12,
        };
        assert_eq!(
            rejection.to_string(),
            "rate limit of 5 requests per 30s exceeded, retry after 12s"
        );
    }

    #[test]
    fn test_duplicate_message_prefers_configured_text() {
        let rejection = Rejection::DuplicateSubmission {
            key: "k".into(),
            first_seen_ms: 0,
            retry_after_secs: 3,
            message: Some("Please do not submit twice".into()),
        };
        assert_eq!(rejection.to_string(), "Please do not submit twice");
    }

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(0), "1970-01-01T00:00:00+00:00");
    }
}

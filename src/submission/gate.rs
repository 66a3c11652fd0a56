//! Duplicate-submission gate.
//!
//! The first call for a key within the interval leaves a marker; any further
//! call while the marker lives is rejected. Nothing is stored about the
//! outcome of the call itself.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::{Rejection, Result, TurnstileError};
use crate::key::GateKey;
use crate::store::{MarkOutcome, RecordStore, SubmissionMarker};

/// Result of `try_acquire`.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Acquired,
    Rejected {
        key: String,
        first_seen_ms: i64,
        retry_after_secs: u64,
        message: Option<String>,
    },
}

impl SubmissionOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, SubmissionOutcome::Acquired)
    }

    /// Turn a rejection into [`TurnstileError::Denied`].
    pub fn ensure_acquired(self) -> Result<()> {
        match self {
            SubmissionOutcome::Acquired => Ok(()),
            SubmissionOutcome::Rejected {
                key,
                first_seen_ms,
                retry_after_secs,
                message,
            } => Err(TurnstileError::Denied(Rejection::DuplicateSubmission {
                key,
                first_seen_ms,
                retry_after_secs,
                message,
            })),
        }
    }
}

#[derive(Clone)]
pub struct SubmissionGate {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    default_message: Option<String>,
}

impl SubmissionGate {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            default_message: None,
        }
    }

    /// Message attached to rejections that do not carry their own.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.default_message = Some(message.into());
        self
    }

    /// Claim `key` for `interval`.
    pub async fn try_acquire(&self, key: &GateKey, interval: Duration) -> Result<SubmissionOutcome> {
        self.try_acquire_with_message(key, interval, None).await
    }

    /// Claim `key` for `interval`, rejecting with `message` if it is held.
    pub async fn try_acquire_with_message(
        &self,
        key: &GateKey,
        interval: Duration,
        message: Option<&str>,
    ) -> Result<SubmissionOutcome> {
        let ttl_ms = interval.as_millis() as i64;
        if ttl_ms <= 0 {
            return Err(TurnstileError::Config(
                "duplicate submission interval must be greater than zero".into(),
            ));
        }

        let storage_key = key.to_string_key();
        let now_ms = self.clock.now_millis();
        let marker = SubmissionMarker::new(storage_key.as_str(), now_ms, ttl_ms);

        match self.store.mark(&marker, ttl_ms, now_ms).await? {
            MarkOutcome::Acquired => {
                trace!(key = %storage_key, ttl_ms = ttl_ms, "Acquired submission marker");
                Ok(SubmissionOutcome::Acquired)
            }
            MarkOutcome::Held(existing) => {
                let remaining_ms = (existing.expires_at_ms - now_ms).max(0);
                let retry_after_secs = ((remaining_ms + 999) / 1000).max(1) as u64;
                debug!(
                    key = %storage_key,
                    first_seen_ms = existing.created_ms,
                    retry_after_secs = retry_after_secs,
                    "Duplicate submission rejected"
                );
                Ok(SubmissionOutcome::Rejected {
                    key: storage_key,
                    first_seen_ms: existing.created_ms,
                    retry_after_secs,
                    message: message
                        .map(str::to_string)
                        .or_else(|| self.default_message.clone()),
                })
            }
        }
    }
}

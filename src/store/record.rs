//! Persisted record shapes.
//!
//! Records are stored as JSON strings under their derived key. The Redis
//! scripts edit these documents in place, so field names here are part of the
//! stored format.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Lifecycle of an idempotent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    Success,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::Success => "SUCCESS",
            RecordStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordStatus::Pending)
    }
}

/// One logical operation's idempotency state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub operation: String,
    /// Hash of the request parameters
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    pub status: RecordStatus,
    pub first_seen_ms: i64,
    pub last_access_ms: i64,
    pub access_count: u64,
    /// Serialized result; only ever set on SUCCESS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error detail; only ever set on FAILED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub expires_at_ms: i64,
}

impl IdempotencyRecord {
    /// A fresh in-flight record.
    pub fn pending(
        key: impl Into<String>,
        operation: impl Into<String>,
        fingerprint: impl Into<String>,
        caller: Option<String>,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Self {
        Self {
            key: key.into(),
            operation: operation.into(),
            fingerprint: fingerprint.into(),
            caller,
            status: RecordStatus::Pending,
            first_seen_ms: now_ms,
            last_access_ms: now_ms,
            access_count: 1,
            result: None,
            error: None,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        }
    }

    /// Move a pending record to its terminal status.
    pub fn apply(&mut self, completion: &Completion, now_ms: i64) {
        self.status = completion.status;
        self.last_access_ms = now_ms;
        self.access_count += 1;
        match completion.status {
            RecordStatus::Success => {
                self.result = completion.payload.clone();
                self.error = None;
            }
            _ => {
                self.error = completion.payload.clone();
                self.result = None;
            }
        }
    }

    /// Record a replayed or rejected access.
    pub fn touch(&mut self, now_ms: i64) {
        self.access_count += 1;
        self.last_access_ms = now_ms;
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(key: &str, raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| TurnstileError::MalformedRecord {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

/// The terminal update applied by the owning execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: RecordStatus,
    /// Result body for SUCCESS, error detail for FAILED
    pub payload: Option<String>,
}

impl Completion {
    pub fn success(result: Option<String>) -> Self {
        Self {
            status: RecordStatus::Success,
            payload: result,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::Failed,
            payload: Some(error.into()),
        }
    }
}

/// Result of an atomic create-if-absent on an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// The caller owns the key and may execute
    Created,
    /// A record already exists; it has been touched on the way out
    Exists(IdempotencyRecord),
}

/// Result of an atomic compare-and-update from PENDING.
#[derive(Debug, Clone, PartialEq)]
pub enum CompleteOutcome {
    Completed(IdempotencyRecord),
    /// The record had already left PENDING and was not changed
    NotPending(IdempotencyRecord),
    /// The record expired or was never created
    Missing,
}

/// Presence marker for duplicate-submission suppression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionMarker {
    pub key: String,
    pub created_ms: i64,
    pub expires_at_ms: i64,
}

impl SubmissionMarker {
    pub fn new(key: impl Into<String>, now_ms: i64, ttl_ms: i64) -> Self {
        Self {
            key: key.into(),
            created_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(key: &str, raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| TurnstileError::MalformedRecord {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Result of an atomic create-if-absent on a submission key.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    Acquired,
    /// Someone else holds the marker
    Held(SubmissionMarker),
}

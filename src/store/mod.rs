//! Keyed, time-bounded state shared by the gates.
//!
//! Two interchangeable backends implement the same contract: [`LocalStore`]
//! keeps state in-process behind per-key locks, [`RedisStore`] keeps it in a
//! shared Redis where every operation is a single Lua script. Both implement
//! [`RecordStore`] here and [`RateLimitBackend`](crate::ratelimit::RateLimitBackend).

mod cache;
mod distributed;
mod fallback;
mod local;
mod record;
mod scripts;

use async_trait::async_trait;

use crate::error::Result;

pub use cache::ResultCache;
pub use fallback::FallbackStore;
pub use local::LocalStore;
pub use record::{
    BeginOutcome, CompleteOutcome, Completion, IdempotencyRecord, MarkOutcome, RecordStatus,
    SubmissionMarker,
};
pub use distributed::{sanitize_url, RedisStore};

/// Identity and reachability of a backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name for logs and health reports.
    fn name(&self) -> &'static str;

    /// Check that the backend can serve requests.
    async fn ping(&self) -> Result<()>;
}

/// Atomic operations over idempotency records and submission markers.
///
/// Every method behaves as if serialized per key: no caller observes a
/// partially applied update.
#[async_trait]
pub trait RecordStore: Backend {
    /// Create `record` under `record.key` with the given lifetime unless a
    /// live record exists. An existing record is touched and returned.
    async fn begin(&self, record: &IdempotencyRecord, ttl_ms: i64, now_ms: i64)
        -> Result<BeginOutcome>;

    /// Move a PENDING record to a terminal status, keeping its expiry.
    async fn complete(&self, key: &str, completion: &Completion, now_ms: i64)
        -> Result<CompleteOutcome>;

    /// Read a live record without touching it.
    async fn get(&self, key: &str, now_ms: i64) -> Result<Option<IdempotencyRecord>>;

    /// Delete a record, optionally only when it has the given status.
    async fn remove(&self, key: &str, only_if: Option<RecordStatus>, now_ms: i64)
        -> Result<bool>;

    /// Create a submission marker unless one is live.
    async fn mark(&self, marker: &SubmissionMarker, ttl_ms: i64, now_ms: i64)
        -> Result<MarkOutcome>;
}

//! In-process cache of completed idempotency records.
//!
//! Only SUCCESS records are cached. They are immutable until they expire, so
//! a cached copy can answer a replay without a round trip to the store.

use std::time::Duration;

use moka::sync::Cache;

use super::record::{IdempotencyRecord, RecordStatus};

/// Bounded cache of successful idempotency records keyed by record key.
#[derive(Clone)]
pub struct ResultCache {
    inner: Cache<String, IdempotencyRecord>,
}

impl ResultCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// A cached SUCCESS record that is still live at `now_ms`.
    pub fn get(&self, key: &str, now_ms: i64) -> Option<IdempotencyRecord> {
        let record = self.inner.get(key)?;
        if record.expires_at_ms <= now_ms {
            self.inner.invalidate(key);
            return None;
        }
        Some(record)
    }

    /// Cache `record` if it completed successfully. Returns whether it was stored.
    pub fn insert(&self, record: &IdempotencyRecord) -> bool {
        if record.status != RecordStatus::Success {
            return false;
        }
        self.inner.insert(record.key.clone(), record.clone());
        true
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.invalidate(key);
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

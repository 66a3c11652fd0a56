//! In-process store.
//!
//! State lives in an arena of per-key lock handles. A handle is created lazily
//! the first time a key is seen and is only dropped by eviction: either the
//! LRU bound pushes it out, or [`LocalStore::purge_expired`] finds its state
//! expired (or the handle empty and idle). Every operation locks the key's handle for the full
//! read-modify-write, so operations on one key are serialized while different
//! keys proceed in parallel.

use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::Result;
use crate::ratelimit::{self, Evaluation, LimitRule, LimitState, RateLimitBackend, Verdict};

use super::record::{
    BeginOutcome, CompleteOutcome, Completion, IdempotencyRecord, MarkOutcome, RecordStatus,
    SubmissionMarker,
};
use super::{Backend, RecordStore};

/// Default bound on the number of keys held in memory.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;
/// Default idle time after which an untouched key may be purged.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

enum Value {
    Limit(LimitState),
    Record(IdempotencyRecord),
    Marker(SubmissionMarker),
}

struct Entry {
    value: Value,
    expires_at_ms: i64,
}

#[derive(Default)]
struct Slot {
    entry: Option<Entry>,
    last_touched_ms: i64,
    /// Set once the handle has left the arena; holders must fetch a new one.
    retired: bool,
}

/// In-process implementation of both store contracts.
pub struct LocalStore {
    slots: Mutex<LruCache<String, Arc<Mutex<Slot>>>>,
    max_entries: usize,
    idle_timeout_ms: i64,
}

impl LocalStore {
    /// Create a store holding at most `max_entries` keys.
    pub fn new(max_entries: usize, idle_timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
            max_entries: capacity.get(),
            idle_timeout_ms: i64::try_from(idle_timeout.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get or create the lock handle for `key`.
    ///
    /// The returned handle is always the one held in the arena. When the
    /// arena is full the least recently used unlocked key is evicted; if every
    /// key is locked the arena grows past its bound until the next purge.
    fn slot(&self, key: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(key) {
            return Arc::clone(slot);
        }

        if slots.len() >= self.max_entries {
            let victim = slots.iter().rev().find_map(|(victim, slot)| {
                let mut guard = slot.try_lock()?;
                guard.retired = true;
                Some(victim.clone())
            });
            match victim {
                Some(victim) => {
                    slots.pop(&victim);
                    trace!(key = %victim, "Evicted least recently used key");
                }
                None => {
                    let grown = NonZeroUsize::new(slots.len() + 1).unwrap_or(NonZeroUsize::MIN);
                    slots.resize(grown);
                    debug!(len = slots.len(), "Every held key is in use, growing local store");
                }
            }
        }

        let slot = Arc::new(Mutex::new(Slot::default()));
        slots.put(key.to_string(), Arc::clone(&slot));
        slot
    }

    /// Give back capacity grown past the bound once keys have left.
    fn shrink(&self, slots: &mut LruCache<String, Arc<Mutex<Slot>>>) {
        let target = slots.len().max(self.max_entries);
        if slots.cap().get() > target {
            if let Some(target) = NonZeroUsize::new(target) {
                slots.resize(target);
            }
        }
    }

    /// Run `f` on the live entry for `key` while holding the key's lock.
    fn with_entry<R>(&self, key: &str, now_ms: i64, f: impl FnOnce(&mut Option<Entry>) -> R) -> R {
        loop {
            let slot = self.slot(key);
            let mut guard = slot.lock();
            if guard.retired {
                continue;
            }
            if guard
                .entry
                .as_ref()
                .is_some_and(|entry| entry.expires_at_ms <= now_ms)
            {
                guard.entry = None;
            }
            guard.last_touched_ms = now_ms;
            return f(&mut guard.entry);
        }
    }

    /// Drop keys whose state has expired, and empty keys idle too long.
    ///
    /// Live state is never dropped here, however long it has been idle.
    /// Keys locked by an in-flight operation are skipped. Returns the number
    /// of keys removed.
    pub fn purge_expired(&self, now_ms: i64) -> usize {
        let mut slots = self.slots.lock();
        let stale: Vec<String> = slots
            .iter()
            .filter_map(|(key, slot)| {
                let mut guard = slot.try_lock()?;
                let stale = match &guard.entry {
                    Some(entry) => entry.expires_at_ms <= now_ms,
                    None => now_ms.saturating_sub(guard.last_touched_ms) >= self.idle_timeout_ms,
                };
                if stale {
                    guard.retired = true;
                    Some(key.clone())
                } else {
                    None
                }
            })
            .collect();
        for key in &stale {
            slots.pop(key);
        }
        self.shrink(&mut slots);
        stale.len()
    }

    /// Periodically purge expired keys until the store is dropped.
    pub fn spawn_janitor(
        self: &Arc<Self>,
        clock: Arc<dyn Clock>,
        every: Duration,
    ) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired(clock.now_millis());
                if purged > 0 {
                    debug!(purged = purged, remaining = store.len(), "Purged local store");
                }
            }
        })
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_IDLE_TIMEOUT)
    }
}

#[async_trait]
impl Backend for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RateLimitBackend for LocalStore {
    async fn evaluate(
        &self,
        key: &str,
        rule: &LimitRule,
        now_ms: i64,
        mode: Evaluation,
    ) -> Result<Verdict> {
        Ok(self.with_entry(key, now_ms, |entry| {
            let current = match entry {
                Some(Entry {
                    value: Value::Limit(state),
                    ..
                }) => Some(state.clone()),
                _ => None,
            };
            let (next, verdict) = ratelimit::evaluate(current, rule, now_ms, mode);
            if let Some(next) = next {
                *entry = Some(Entry {
                    value: Value::Limit(next),
                    expires_at_ms: now_ms.saturating_add(rule.state_ttl_ms()),
                });
            }
            verdict
        }))
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let slot = {
            let mut slots = self.slots.lock();
            let slot = slots.pop(key);
            self.shrink(&mut slots);
            slot
        };
        let Some(slot) = slot else {
            return Ok(false);
        };
        let mut guard = slot.lock();
        guard.retired = true;
        Ok(guard.entry.take().is_some())
    }
}

#[async_trait]
impl RecordStore for LocalStore {
    async fn begin(
        &self,
        record: &IdempotencyRecord,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Result<BeginOutcome> {
        Ok(self.with_entry(&record.key, now_ms, |entry| match entry {
            Some(Entry {
                value: Value::Record(existing),
                ..
            }) => {
                existing.touch(now_ms);
                BeginOutcome::Exists(existing.clone())
            }
            _ => {
                *entry = Some(Entry {
                    value: Value::Record(record.clone()),
                    expires_at_ms: now_ms.saturating_add(ttl_ms),
                });
                BeginOutcome::Created
            }
        }))
    }

    async fn complete(
        &self,
        key: &str,
        completion: &Completion,
        now_ms: i64,
    ) -> Result<CompleteOutcome> {
        Ok(self.with_entry(key, now_ms, |entry| match entry {
            Some(Entry {
                value: Value::Record(record),
                ..
            }) => {
                if record.status == RecordStatus::Pending {
                    record.apply(completion, now_ms);
                    CompleteOutcome::Completed(record.clone())
                } else {
                    CompleteOutcome::NotPending(record.clone())
                }
            }
            _ => CompleteOutcome::Missing,
        }))
    }

    async fn get(&self, key: &str, now_ms: i64) -> Result<Option<IdempotencyRecord>> {
        Ok(self.with_entry(key, now_ms, |entry| match entry {
            Some(Entry {
                value: Value::Record(record),
                ..
            }) => Some(record.clone()),
            _ => None,
        }))
    }

    async fn remove(&self, key: &str, only_if: Option<RecordStatus>, now_ms: i64) -> Result<bool> {
        Ok(self.with_entry(key, now_ms, |entry| {
            let matches = match entry {
                Some(Entry {
                    value: Value::Record(record),
                    ..
                }) => only_if.map_or(true, |status| record.status == status),
                Some(_) => only_if.is_none(),
                None => false,
            };
            if matches {
                *entry = None;
            }
            matches
        }))
    }

    async fn mark(
        &self,
        marker: &SubmissionMarker,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Result<MarkOutcome> {
        Ok(self.with_entry(&marker.key, now_ms, |entry| match entry {
            Some(Entry {
                value: Value::Marker(existing),
                ..
            }) => MarkOutcome::Held(existing.clone()),
            _ => {
                *entry = Some(Entry {
                    value: Value::Marker(marker.clone()),
                    expires_at_ms: now_ms.saturating_add(ttl_ms),
                });
                MarkOutcome::Acquired
            }
        }))
    }
}

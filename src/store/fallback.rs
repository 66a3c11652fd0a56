//! Automatic fallback from the shared store to the local one.
//!
//! When the primary store fails with a backend error, the same call is
//! retried once against the local store. Denials and configuration errors are
//! passed through untouched. State written during an outage stays local and
//! is not reconciled with the primary afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;
use crate::ratelimit::{Evaluation, LimitRule, RateLimitBackend, Verdict};

use super::local::LocalStore;
use super::record::{
    BeginOutcome, CompleteOutcome, Completion, IdempotencyRecord, MarkOutcome, RecordStatus,
    SubmissionMarker,
};
use super::{Backend, RecordStore};

/// Wraps a primary store with a one-shot local fallback per call.
pub struct FallbackStore<P> {
    primary: Arc<P>,
    fallback: Arc<LocalStore>,
    degraded: AtomicBool,
}

impl<P: Backend> FallbackStore<P> {
    pub fn new(primary: Arc<P>, fallback: Arc<LocalStore>) -> Self {
        Self {
            primary,
            fallback,
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether the most recent call had to use the local store.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn primary(&self) -> &Arc<P> {
        &self.primary
    }

    /// Decide whether `result` should be retried locally, tracking the
    /// degraded flag on the way.
    fn should_fall_back<T>(&self, operation: &str, result: &Result<T>) -> bool {
        match result {
            Err(e) if e.is_backend_failure() => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(
                        backend = self.primary.name(),
                        operation = operation,
                        error = %e,
                        "Primary store failed, falling back to local store"
                    );
                }
                true
            }
            _ => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!(backend = self.primary.name(), "Primary store recovered");
                }
                false
            }
        }
    }
}

#[async_trait]
impl<P: Backend> Backend for FallbackStore<P> {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn ping(&self) -> Result<()> {
        self.primary.ping().await
    }
}

#[async_trait]
impl<P: RateLimitBackend> RateLimitBackend for FallbackStore<P> {
    async fn evaluate(
        &self,
        key: &str,
        rule: &LimitRule,
        now_ms: i64,
        mode: Evaluation,
    ) -> Result<Verdict> {
        let result = self.primary.evaluate(key, rule, now_ms, mode).await;
        if self.should_fall_back("evaluate", &result) {
            return self.fallback.evaluate(key, rule, now_ms, mode).await;
        }
        result
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        // Both copies must go, or a key reset during an outage would resurface.
        let local = RateLimitBackend::reset(self.fallback.as_ref(), key).await?;
        match self.primary.reset(key).await {
            Ok(primary) => Ok(primary || local),
            Err(e) if e.is_backend_failure() && local => {
                warn!(key = %key, error = %e, "Reset only applied to local store");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<P: RecordStore> RecordStore for FallbackStore<P> {
    async fn begin(
        &self,
        record: &IdempotencyRecord,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Result<BeginOutcome> {
        let result = self.primary.begin(record, ttl_ms, now_ms).await;
        if self.should_fall_back("begin", &result) {
            return self.fallback.begin(record, ttl_ms, now_ms).await;
        }
        result
    }

    async fn complete(
        &self,
        key: &str,
        completion: &Completion,
        now_ms: i64,
    ) -> Result<CompleteOutcome> {
        let result = self.primary.complete(key, completion, now_ms).await;
        if self.should_fall_back("complete", &result) {
            return self.fallback.complete(key, completion, now_ms).await;
        }
        // A record begun during an outage lives locally; finish it there.
        if let Ok(CompleteOutcome::Missing) = result {
            let local = self.fallback.complete(key, completion, now_ms).await?;
            if local != CompleteOutcome::Missing {
                return Ok(local);
            }
        }
        result
    }

    async fn get(&self, key: &str, now_ms: i64) -> Result<Option<IdempotencyRecord>> {
        let result = self.primary.get(key, now_ms).await;
        if self.should_fall_back("get", &result) {
            return self.fallback.get(key, now_ms).await;
        }
        result
    }

    async fn remove(&self, key: &str, only_if: Option<RecordStatus>, now_ms: i64) -> Result<bool> {
        let local = self.fallback.remove(key, only_if, now_ms).await?;
        let result = self.primary.remove(key, only_if, now_ms).await;
        if self.should_fall_back("remove", &result) {
            return Ok(local);
        }
        result.map(|primary| primary || local)
    }

    async fn mark(
        &self,
        marker: &SubmissionMarker,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Result<MarkOutcome> {
        let result = self.primary.mark(marker, ttl_ms, now_ms).await;
        if self.should_fall_back("mark", &result) {
            return self.fallback.mark(marker, ttl_ms, now_ms).await;
        }
        result
    }
}

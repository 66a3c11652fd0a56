//! Rate limit backend trait for abstracting local and distributed state.

use async_trait::async_trait;

use crate::error::Result;
use crate::store::Backend;

use super::algorithm::{Evaluation, LimitRule, Verdict};

/// Trait for rate limit state backends.
///
/// This trait abstracts over the in-process `LocalStore` and the shared
/// `RedisStore` so the engine works with either. An implementation must run
/// the whole read-check-write for one key atomically.
#[async_trait]
pub trait RateLimitBackend: Backend {
    /// Run one check of `rule` against the state stored under `key`.
    async fn evaluate(
        &self,
        key: &str,
        rule: &LimitRule,
        now_ms: i64,
        mode: Evaluation,
    ) -> Result<Verdict>;

    /// Drop all rate limit state for `key`. Returns whether anything existed.
    async fn reset(&self, key: &str) -> Result<bool>;
}

//! Core rate limiter implementation.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::{format_millis, Rejection, Result, TurnstileError};
use crate::key::{Dimension, GateKey};

use super::algorithm::{Algorithm, Evaluation, LimitRule, Verdict};
use super::backend::RateLimitBackend;

/// Outcome of a rate limit check, as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitResult {
    pub key: String,
    pub allowed: bool,
    pub remaining_permits: u64,
    pub total_permits: u64,
    /// Epoch milliseconds at which capacity is fully restored
    pub reset_time_ms: i64,
    pub retry_after_secs: u64,
    pub algorithm: Algorithm,
    pub dimension: Dimension,
    pub window_secs: u64,
}

impl RateLimitResult {
    fn from_verdict(key: &GateKey, rule: &LimitRule, verdict: Verdict) -> Self {
        Self {
            key: key.to_string_key(),
            allowed: verdict.allowed,
            remaining_permits: verdict.remaining,
            total_permits: verdict.total,
            reset_time_ms: verdict.reset_at_ms,
            retry_after_secs: verdict.retry_after_secs,
            algorithm: rule.algorithm,
            dimension: key.dimension,
            window_secs: rule.window_secs,
        }
    }

    /// Turn a denial into [`TurnstileError::Denied`].
    pub fn ensure_allowed(&self) -> Result<()> {
        if self.allowed {
            return Ok(());
        }
        Err(TurnstileError::Denied(Rejection::RateLimited {
            key: self.key.clone(),
            limit: self.total_permits,
            window_secs: self.window_secs,
            retry_after_secs: self.retry_after_secs,
        }))
    }

    /// The reset time as an RFC 3339 timestamp.
    pub fn reset_time(&self) -> String {
        format_millis(self.reset_time_ms)
    }
}

/// The rate limit engine.
///
/// Stateless apart from its backend handle; one limiter can serve any number
/// of keys and rules concurrently.
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn RateLimitBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Check `rule` for `key`, consuming one permit if allowed.
    pub async fn check(&self, key: &GateKey, rule: &LimitRule) -> Result<RateLimitResult> {
        self.run(key, rule, Evaluation::Consume).await
    }

    /// Report the state `check` would see, without consuming anything.
    pub async fn status(&self, key: &GateKey, rule: &LimitRule) -> Result<RateLimitResult> {
        self.run(key, rule, Evaluation::Peek).await
    }

    /// Clear all state held for `key`.
    pub async fn reset(&self, key: &GateKey) -> Result<bool> {
        let key = key.to_string_key();
        let existed = self.backend.reset(&key).await?;
        debug!(key = %key, existed = existed, "Reset rate limit");
        Ok(existed)
    }

    pub fn backend(&self) -> &Arc<dyn RateLimitBackend> {
        &self.backend
    }

    async fn run(
        &self,
        key: &GateKey,
        rule: &LimitRule,
        mode: Evaluation,
    ) -> Result<RateLimitResult> {
        rule.validate()?;
        let storage_key = key.to_string_key();
        let now_ms = self.clock.now_millis();

        trace!(
            key = %storage_key,
            algorithm = %rule.algorithm,
            permits = rule.permits,
            window_secs = rule.window_secs,
            mode = ?mode,
            "Checking rate limit"
        );

        let verdict = self.backend.evaluate(&storage_key, rule, now_ms, mode).await?;
        if !verdict.allowed {
            debug!(
                key = %storage_key,
                algorithm = %rule.algorithm,
                retry_after_secs = verdict.retry_after_secs,
                "Rate limit exceeded"
            );
        }
        Ok(RateLimitResult::from_verdict(key, rule, verdict))
    }
}

//! Composition root.
//!
//! Builds the stores from configuration and hands out gates wired to the
//! backend each operation is configured for.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, TurnstileConfig};
use crate::error::{Result, TurnstileError};
use crate::idempotency::IdempotencyGate;
use crate::key::{Dimension, GateKey};
use crate::ratelimit::{OperationPolicy, RateLimitBackend, RateLimitResult, RateLimiter, RuleRegistry};
use crate::store::{Backend, FallbackStore, LocalStore, RecordStore, RedisStore, ResultCache};
use crate::submission::{SubmissionGate, SubmissionOutcome};

/// Backend reachability as reported by [`Gatekeeper::health`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub backend: String,
    pub reachable: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether calls are currently being served by the local fallback
    pub fallback_active: bool,
    pub local_entries: usize,
}

/// The Redis store seen through each of the traits the gates need.
struct Shared {
    limits: Arc<dyn RateLimitBackend>,
    records: Arc<dyn RecordStore>,
    probe: Arc<dyn Backend>,
    fallback: Option<Arc<FallbackStore<RedisStore>>>,
}

impl Shared {
    fn direct(store: Arc<RedisStore>) -> Self {
        Self {
            limits: store.clone(),
            records: store.clone(),
            probe: store,
            fallback: None,
        }
    }

    fn with_fallback(store: Arc<FallbackStore<RedisStore>>) -> Self {
        Self {
            limits: store.clone(),
            records: store.clone(),
            probe: store.clone(),
            fallback: Some(store),
        }
    }
}

/// Entry point tying configuration, rules and stores together.
pub struct Gatekeeper {
    config: TurnstileConfig,
    rules: Arc<RuleRegistry>,
    clock: Arc<dyn Clock>,
    local: Arc<LocalStore>,
    shared: Option<Shared>,
    /// Successful idempotent results only; rate limit state is never cached
    cache: Option<ResultCache>,
    janitor: Option<JoinHandle<()>>,
}

impl Gatekeeper {
    /// Build from configuration using the system clock.
    pub async fn from_config(config: TurnstileConfig) -> Result<Self> {
        Self::build(config, Arc::new(SystemClock)).await
    }

    /// Build from configuration, connecting to Redis when configured.
    ///
    /// A failed initial Redis connection is an error even with
    /// `fallback_to_local`; fallback covers failures after startup.
    pub async fn build(config: TurnstileConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut gatekeeper = Self::local(config, clock)?;
        let storage = &gatekeeper.config.storage;

        if storage.backend == BackendKind::Redis {
            let redis = Arc::new(RedisStore::connect(&storage.redis).await?);
            gatekeeper.shared = Some(if storage.fallback_to_local {
                info!("Local fallback enabled for Redis store");
                Shared::with_fallback(Arc::new(FallbackStore::new(
                    redis,
                    Arc::clone(&gatekeeper.local),
                )))
            } else {
                Shared::direct(redis)
            });
            if storage.cache.enabled {
                gatekeeper.cache = Some(ResultCache::new(
                    storage.cache.max_entries,
                    storage.cache.ttl(),
                ));
            }
        }

        gatekeeper.janitor = Some(gatekeeper.local.spawn_janitor(
            Arc::clone(&gatekeeper.clock),
            gatekeeper.config.storage.local.purge_interval(),
        ));
        Ok(gatekeeper)
    }

    /// Build with the in-process store only, whatever the configured backend.
    ///
    /// No background purge runs; call [`LocalStore::purge_expired`] through
    /// [`Gatekeeper::local_store`] if needed.
    pub fn local(config: TurnstileConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let rules = match &config.rules_path {
            Some(path) => RuleRegistry::from_file(path)?,
            None => RuleRegistry::new(),
        };
        let local = Arc::new(LocalStore::new(
            config.storage.local.max_entries,
            config.storage.local.idle_timeout(),
        ));
        Ok(Self {
            config,
            rules: Arc::new(rules),
            clock,
            local,
            shared: None,
            cache: None,
            janitor: None,
        })
    }

    /// Replace the operation rules.
    pub fn with_rules(mut self, rules: RuleRegistry) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    pub fn config(&self) -> &TurnstileConfig {
        &self.config
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local
    }

    fn policy(&self, operation: &str) -> Arc<OperationPolicy> {
        self.rules.get(operation).unwrap_or_default()
    }

    fn backend_kind(&self, policy: &OperationPolicy) -> BackendKind {
        policy
            .storage_backend
            .unwrap_or(self.config.storage.backend)
    }

    fn shared(&self) -> Result<&Shared> {
        self.shared.as_ref().ok_or_else(|| {
            TurnstileError::Config("redis backend requested but not configured".into())
        })
    }

    fn limits(&self, kind: BackendKind) -> Result<Arc<dyn RateLimitBackend>> {
        match kind {
            BackendKind::Local => Ok(self.local.clone()),
            BackendKind::Redis => Ok(Arc::clone(&self.shared()?.limits)),
        }
    }

    fn records(&self, kind: BackendKind) -> Result<Arc<dyn RecordStore>> {
        match kind {
            BackendKind::Local => Ok(self.local.clone()),
            BackendKind::Redis => Ok(Arc::clone(&self.shared()?.records)),
        }
    }

    /// A rate limiter on the backend configured for `operation`.
    pub fn rate_limiter(&self, operation: &str) -> Result<RateLimiter> {
        let policy = self.policy(operation);
        Ok(RateLimiter::new(
            self.limits(self.backend_kind(&policy))?,
            Arc::clone(&self.clock),
        ))
    }

    /// An idempotency gate configured for `operation`.
    pub fn idempotency(&self, operation: &str) -> Result<IdempotencyGate> {
        let policy = self.policy(operation);
        let kind = self.backend_kind(&policy);
        let mut gate = IdempotencyGate::from_settings(
            self.records(kind)?,
            Arc::clone(&self.clock),
            &self.config.idempotency,
        );
        if let Some(idempotency) = &policy.idempotency {
            gate = gate.with_default_timeout(idempotency.timeout());
        }
        if kind == BackendKind::Redis {
            if let Some(cache) = &self.cache {
                gate = gate.with_cache(cache.clone());
            }
        }
        Ok(gate)
    }

    /// A duplicate-submission gate configured for `operation`.
    pub fn duplicate_submission(&self, operation: &str) -> Result<SubmissionGate> {
        let policy = self.policy(operation);
        let message = policy
            .duplicate_submission
            .as_ref()
            .and_then(|p| p.message.clone())
            .unwrap_or_else(|| self.config.duplicate_submission.message.clone());
        Ok(SubmissionGate::new(
            self.records(self.backend_kind(&policy))?,
            Arc::clone(&self.clock),
        )
        .with_message(message))
    }

    /// Check the rate limit configured for `operation`, consuming a permit.
    ///
    /// `values` are the resolved identity values for the rule's dimension.
    /// Returns `None` when the operation has no rate limit.
    pub async fn check_operation(
        &self,
        operation: &str,
        values: &[&str],
    ) -> Result<Option<RateLimitResult>> {
        let policy = self.policy(operation);
        let Some(rate_limit) = &policy.rate_limit else {
            return Ok(None);
        };
        let key = GateKey::rate_limit(operation, rate_limit.dimension, values);
        let limiter = RateLimiter::new(
            self.limits(self.backend_kind(&policy))?,
            Arc::clone(&self.clock),
        );
        limiter.check(&key, &rate_limit.rule).await.map(Some)
    }

    /// Claim the duplicate-submission marker for `operation`.
    ///
    /// Operations without a configured interval use the service default.
    pub async fn acquire_submission(
        &self,
        operation: &str,
        values: &[&str],
    ) -> Result<SubmissionOutcome> {
        let policy = self.policy(operation);
        let (interval, dimension) = match &policy.duplicate_submission {
            Some(p) => (p.interval(), p.dimension),
            None => (
                Duration::from_secs(self.config.duplicate_submission.default_interval_secs),
                Dimension::Global,
            ),
        };
        let key = GateKey::submission(operation, dimension, values);
        self.duplicate_submission(operation)?
            .try_acquire(&key, interval)
            .await
    }

    /// Clear one key's rate limit state on every store that may hold it.
    pub async fn reset_rate_limit(&self, key: &GateKey) -> Result<bool> {
        let storage_key = key.to_string_key();
        let mut existed = RateLimitBackend::reset(self.local.as_ref(), &storage_key).await?;
        if let Some(shared) = &self.shared {
            existed |= shared.limits.reset(&storage_key).await?;
        }
        info!(key = %storage_key, existed = existed, "Reset rate limit");
        Ok(existed)
    }

    /// Probe the default backend.
    pub async fn health(&self) -> HealthReport {
        let probe: Arc<dyn Backend> = match &self.shared {
            Some(shared) => Arc::clone(&shared.probe),
            None => self.local.clone(),
        };
        let started = Instant::now();
        let result = probe.ping().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = &result {
            warn!(backend = probe.name(), error = %e, "Health check failed");
        }
        HealthReport {
            backend: probe.name().to_string(),
            reachable: result.is_ok(),
            latency_ms,
            error: result.err().map(|e| e.to_string()),
            fallback_active: self
                .shared
                .as_ref()
                .and_then(|s| s.fallback.as_ref())
                .is_some_and(|f| f.is_degraded()),
            local_entries: self.local.len(),
        }
    }
}

impl Drop for Gatekeeper {
    fn drop(&mut self) {
        if let Some(janitor) = self.janitor.take() {
            janitor.abort();
        }
    }
}

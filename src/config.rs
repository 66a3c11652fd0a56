//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::idempotency::FailurePolicy;

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// State store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Idempotency gate defaults
    #[serde(default)]
    pub idempotency: IdempotencySettings,

    /// Duplicate-submission gate defaults
    #[serde(default)]
    pub duplicate_submission: DuplicateSubmissionSettings,

    /// Path to the operation rules file
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// Where gate state lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Redis,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Redis => f.write_str("redis"),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Default backend for operations that do not pick one
    #[serde(default)]
    pub backend: BackendKind,

    /// Retry against the local store once when Redis fails
    #[serde(default)]
    pub fallback_to_local: bool,

    #[serde(default)]
    pub local: LocalStoreSettings,

    #[serde(default)]
    pub redis: RedisSettings,

    #[serde(default)]
    pub cache: CacheSettings,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            fallback_to_local: false,
            local: LocalStoreSettings::default(),
            redis: RedisSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

/// In-process store bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreSettings {
    /// Maximum number of keys held
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Keys holding no live state are purged after this long untouched.
    /// Live state is kept until its own expiry regardless.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often expired keys are purged
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for LocalStoreSettings {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            idle_timeout_secs: default_idle_timeout(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl LocalStoreSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

fn default_max_entries() -> usize {
    100_000
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_purge_interval() -> u64 {
    60
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prepended to every key, separated by `:`
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for a single Redis round trip
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl RedisSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

fn default_command_timeout() -> u64 {
    500
}

/// Cache of successful idempotent results kept in front of Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    #[serde(default = "default_cache_size")]
    pub max_entries: u64,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_entries: default_cache_size(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_size() -> u64 {
    10_000
}

fn default_cache_ttl() -> u64 {
    300
}

/// Idempotency gate defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencySettings {
    /// Record lifetime when an operation does not set one
    #[serde(default = "default_idempotency_timeout")]
    pub default_timeout_secs: u64,

    /// Results larger than this are not stored
    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: usize,

    /// What a caller sees when the previous execution failed
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_idempotency_timeout(),
            max_result_bytes: default_max_result_bytes(),
            on_failure: FailurePolicy::default(),
        }
    }
}

fn default_idempotency_timeout() -> u64 {
    3600
}

fn default_max_result_bytes() -> usize {
    64 * 1024
}

/// Duplicate-submission gate defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateSubmissionSettings {
    #[serde(default = "default_submission_interval")]
    pub default_interval_secs: u64,

    /// Message returned to rejected callers
    #[serde(default = "default_submission_message")]
    pub message: String,
}

impl Default for DuplicateSubmissionSettings {
    fn default() -> Self {
        Self {
            default_interval_secs: default_submission_interval(),
            message: default_submission_message(),
        }
    }
}

fn default_submission_interval() -> u64 {
    5
}

fn default_submission_message() -> String {
    "Duplicate submission, please try again later".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a file, with `TURNSTILE__*` environment
    /// overrides (for example `TURNSTILE__STORAGE__BACKEND=redis`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gates cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(TurnstileError::Config(reason.to_string()));
        if self.storage.local.max_entries == 0 {
            return invalid("storage.local.max_entries must be greater than zero");
        }
        if self.storage.local.purge_interval_secs == 0 {
            return invalid("storage.local.purge_interval_secs must be greater than zero");
        }
        if self.storage.redis.command_timeout_ms == 0 {
            return invalid("storage.redis.command_timeout_ms must be greater than zero");
        }
        if self.storage.cache.enabled && self.storage.cache.max_entries == 0 {
            return invalid("storage.cache.max_entries must be greater than zero");
        }
        if self.idempotency.default_timeout_secs == 0 {
            return invalid("idempotency.default_timeout_secs must be greater than zero");
        }
        if self.duplicate_submission.default_interval_secs == 0 {
            return invalid(
                "duplicate_submission.default_interval_secs must be greater than zero",
            );
        }
        Ok(())
    }
}

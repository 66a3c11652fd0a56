//! Per-operation gating rules.
//!
//! Rules are loaded from a YAML document keyed by operation identity:
//!
//! ```yaml
//! operations:
//!   orders.create:
//!     rate_limit:
//!       algorithm: token_bucket
//!       permits: 10
//!       window_seconds: 60
//!       dimension: user
//!     idempotency:
//!       timeout_seconds: 600
//!     duplicate_submission:
//!       interval_seconds: 5
//!       message: "Order already submitted"
//! ```
//!
//! The registry is a concurrent map, so rules can be replaced while requests
//! are being gated.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::BackendKind;
use crate::error::{Result, TurnstileError};
use crate::key::Dimension;

use super::algorithm::LimitRule;

/// Rate limit section of an operation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(flatten)]
    pub rule: LimitRule,
    #[serde(default)]
    pub dimension: Dimension,
}

/// Idempotency section of an operation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyPolicy {
    pub timeout_seconds: u64,
}

impl IdempotencyPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Duplicate-submission section of an operation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionPolicy {
    pub interval_seconds: u64,
    #[serde(default)]
    pub dimension: Dimension,
    /// Message returned to rejected callers
    #[serde(default)]
    pub message: Option<String>,
}

impl SubmissionPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Everything configured for one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationPolicy {
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
    #[serde(default)]
    pub idempotency: Option<IdempotencyPolicy>,
    #[serde(default)]
    pub duplicate_submission: Option<SubmissionPolicy>,
    /// Overrides the service-wide backend for this operation
    #[serde(default)]
    pub storage_backend: Option<BackendKind>,
}

impl OperationPolicy {
    pub fn validate(&self, operation: &str) -> Result<()> {
        let invalid = |reason: &str| {
            Err(TurnstileError::Config(format!(
                "operation {}: {}",
                operation, reason
            )))
        };
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.rule.validate()?;
        }
        if matches!(&self.idempotency, Some(p) if p.timeout_seconds == 0) {
            return invalid("idempotency timeout_seconds must be positive");
        }
        if matches!(&self.duplicate_submission, Some(p) if p.interval_seconds == 0) {
            return invalid("duplicate_submission interval_seconds must be positive");
        }
        Ok(())
    }
}

/// A rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesDocument {
    #[serde(default)]
    pub operations: HashMap<String, OperationPolicy>,
}

impl RulesDocument {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse rules: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        for (operation, policy) in &self.operations {
            policy.validate(operation)?;
        }
        Ok(())
    }
}

/// Live table of operation policies.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    policies: DashMap<String, Arc<OperationPolicy>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a YAML rules document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let registry = Self::new();
        registry.replace_all(RulesDocument::from_yaml(yaml)?)?;
        Ok(registry)
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading operation rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn get(&self, operation: &str) -> Option<Arc<OperationPolicy>> {
        self.policies.get(operation).map(|p| Arc::clone(p.value()))
    }

    /// Insert or replace the policy for one operation.
    pub fn upsert(&self, operation: impl Into<String>, policy: OperationPolicy) -> Result<()> {
        let operation = operation.into();
        policy.validate(&operation)?;
        info!(operation = %operation, "Updated operation policy");
        self.policies.insert(operation, Arc::new(policy));
        Ok(())
    }

    pub fn remove(&self, operation: &str) -> bool {
        self.policies.remove(operation).is_some()
    }

    /// Swap in a whole new rule set. Nothing changes if any rule is invalid.
    pub fn replace_all(&self, document: RulesDocument) -> Result<()> {
        document.validate()?;
        let count = document.operations.len();
        self.policies
            .retain(|operation, _| document.operations.contains_key(operation));
        for (operation, policy) in document.operations {
            self.policies.insert(operation, Arc::new(policy));
        }
        info!(operations = count, "Loaded operation rules");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Algorithm;

    const RULES: &str = r#"
operations:
  orders.create:
    rate_limit:
      algorithm: TOKEN_BUCKET
      permits: 10
      window_seconds: 60
      bucket_capacity: 20
      refill_rate: 2
      dimension: user
    idempotency:
      timeout_seconds: 600
    duplicate_submission:
      interval_seconds: 5
      message: "Order already submitted"
  search:
    rate_limit:
      permits: 100
      window_seconds: 1
    storage_backend: local
"#;

    #[test]
    fn test_parse_rules() {
        let registry = RuleRegistry::from_yaml(RULES).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.operations(), vec!["orders.create", "search"]);

        let orders = registry.get("orders.create").unwrap();
        let rate_limit = orders.rate_limit.as_ref().unwrap();
        assert_eq!(rate_limit.rule.algorithm, Algorithm::TokenBucket);
        assert_eq!(rate_limit.rule.bucket_capacity, Some(20));
        assert_eq!(rate_limit.rule.refill_rate, Some(2.0));
        assert_eq!(rate_limit.dimension, Dimension::User);
        assert_eq!(orders.idempotency.as_ref().unwrap().timeout(), Duration::from_secs(600));
        let submission = orders.duplicate_submission.as_ref().unwrap();
        assert_eq!(submission.message.as_deref(), Some("Order already submitted"));
        assert_eq!(submission.dimension, Dimension::Global);
        assert_eq!(orders.storage_backend, None);

        let search = registry.get("search").unwrap();
        let rate_limit = search.rate_limit.as_ref().unwrap();
        assert_eq!(rate_limit.rule.algorithm, Algorithm::SlidingWindow);
        assert_eq!(rate_limit.dimension, Dimension::Global);
        assert_eq!(search.storage_backend, Some(BackendKind::Local));
        assert!(search.idempotency.is_none());
    }

    #[test]
    fn test_unsupported_algorithm_is_rejected() {
        let yaml = r#"
operations:
  search:
    rate_limit:
      algorithm: gcra
      permits: 1
      window_seconds: 1
"#;
        let err = RuleRegistry::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_invalid_rules_leave_registry_unchanged() {
        let registry = RuleRegistry::from_yaml(RULES).unwrap();
        let yaml = r#"
operations:
  orders.create:
    duplicate_submission:
      interval_seconds: 0
"#;
        let document = RulesDocument::from_yaml(yaml).unwrap();
        assert!(registry.replace_all(document).is_err());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_replace_all_drops_missing_operations() {
        let registry = RuleRegistry::from_yaml(RULES).unwrap();
        let yaml = r#"
operations:
  search:
    rate_limit:
      permits: 5
      window_seconds: 1
"#;
        registry
            .replace_all(RulesDocument::from_yaml(yaml).unwrap())
            .unwrap();
        assert_eq!(registry.operations(), vec!["search"]);
        let search = registry.get("search").unwrap();
        assert_eq!(search.rate_limit.as_ref().unwrap().rule.permits, 5);
    }

    #[test]
    fn test_upsert_and_remove() {
        let registry = RuleRegistry::new();
        assert!(registry.is_empty());

        let policy = OperationPolicy {
            idempotency: Some(IdempotencyPolicy { timeout_seconds: 30 }),
            ..Default::default()
        };
        registry.upsert("payments.capture", policy).unwrap();
        assert!(registry.get("payments.capture").is_some());

        let bad = OperationPolicy {
            idempotency: Some(IdempotencyPolicy { timeout_seconds: 0 }),
            ..Default::default()
        };
        assert!(registry.upsert("payments.refund", bad).is_err());

        assert!(registry.remove("payments.capture"));
        assert!(!registry.remove("payments.capture"));
    }
}

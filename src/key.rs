//! Gate key derivation.
//!
//! Every piece of gated state lives under a single string key built from the
//! gate kind, the operation identity, the dimension and the resolved identity
//! values, serialized in a consistent order.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Which gate a key belongs to. Keeps the three state families apart even
/// when they share an operation name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateKind {
    RateLimit,
    Idempotency,
    Submission,
}

impl GateKind {
    fn prefix(&self) -> &'static str {
        match self {
            GateKind::RateLimit => "rate_limit",
            GateKind::Idempotency => "idempotent",
            GateKind::Submission => "resubmit",
        }
    }
}

/// The identity axis a gate partitions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    /// One bucket shared by every caller
    #[default]
    Global,
    /// Per client address
    Ip,
    /// Per authenticated user
    User,
    /// Per value of a caller-supplied expression
    Custom,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Global => "global",
            Dimension::Ip => "ip",
            Dimension::User => "user",
            Dimension::Custom => "custom",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies one (gate, operation, dimension, identity)
/// combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GateKey {
    pub kind: GateKind,
    pub operation: String,
    pub dimension: Dimension,
    /// Resolved identity values, in resolver order
    pub values: Vec<String>,
}

impl GateKey {
    pub fn new(
        kind: GateKind,
        operation: impl Into<String>,
        dimension: Dimension,
        values: Vec<String>,
    ) -> Self {
        // A global key ignores identity values so every caller shares it.
        let values = if dimension == Dimension::Global {
            Vec::new()
        } else {
            values
        };
        Self {
            kind,
            operation: operation.into(),
            dimension,
            values,
        }
    }

    /// Key for a rate limit counter.
    pub fn rate_limit(operation: &str, dimension: Dimension, values: &[&str]) -> Self {
        Self::new(
            GateKind::RateLimit,
            operation,
            dimension,
            values.iter().map(|v| v.to_string()).collect(),
        )
    }

    /// Key for an idempotency record. `idempotency_key` is the client-supplied
    /// or resolver-derived token naming the logical operation.
    pub fn idempotency(operation: &str, idempotency_key: &str) -> Self {
        Self::new(
            GateKind::Idempotency,
            operation,
            Dimension::Custom,
            vec![idempotency_key.to_string()],
        )
    }

    /// Key for a duplicate-submission marker.
    pub fn submission(operation: &str, dimension: Dimension, values: &[&str]) -> Self {
        Self::new(
            GateKind::Submission,
            operation,
            dimension,
            values.iter().map(|v| v.to_string()).collect(),
        )
    }

    /// Serialize the key.
    ///
    /// Format: `{kind}:{operation}:{dimension}[:{value},{value}...]`
    pub fn to_string_key(&self) -> String {
        let mut key = format!(
            "{}:{}:{}",
            self.kind.prefix(),
            self.operation,
            self.dimension
        );
        if !self.values.is_empty() {
            key.push(':');
            key.push_str(&self.values.join(","));
        }
        key
    }
}

impl std::fmt::Display for GateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Hash request parameters into a stable fingerprint.
///
/// Object keys are ordered before hashing, so two parameter sets that differ
/// only in field order share a fingerprint.
pub fn fingerprint<T: Serialize + ?Sized>(params: &T) -> Result<String> {
    let canonical = serde_json::to_vec(&canonicalize(serde_json::to_value(params)?))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(canonicalize).collect())
        }
        other => other,
    }
}

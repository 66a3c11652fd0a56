//! Idempotency gate state machine.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::config::IdempotencySettings;
use crate::error::{Rejection, Result, TurnstileError};
use crate::key::{fingerprint, GateKey};
use crate::store::{
    BeginOutcome, CompleteOutcome, Completion, IdempotencyRecord, RecordStatus, RecordStore,
    ResultCache,
};

/// What callers see when the previous execution for a key failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Return the stored failure until the record expires
    #[default]
    Replay,
    /// Discard the failed record and let the caller execute again
    Retry,
}

/// One call through the idempotency gate.
#[derive(Debug, Clone)]
pub struct IdempotencyRequest {
    pub key: GateKey,
    /// Hash of the request parameters; empty disables the mismatch check
    pub fingerprint: String,
    pub caller: Option<String>,
    /// Record lifetime; the gate default applies when unset
    pub timeout: Option<Duration>,
}

impl IdempotencyRequest {
    pub fn new(key: GateKey) -> Self {
        Self {
            key,
            fingerprint: String::new(),
            caller: None,
            timeout: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    /// Fingerprint the given request parameters.
    pub fn with_params<T: Serialize + ?Sized>(self, params: &T) -> Result<Self> {
        Ok(self.with_fingerprint(fingerprint(params)?))
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of `begin`.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotentOutcome {
    /// The caller owns the key and must execute, then complete
    Created,
    /// Another execution is in flight
    InProgress(IdempotencyRecord),
    /// A previous execution succeeded; `result` is its stored body, if any
    Completed {
        record: IdempotencyRecord,
        result: Option<String>,
    },
    /// A previous execution failed and the failure is replayed
    Failed {
        record: IdempotencyRecord,
        error: String,
    },
    /// The key was first used with different parameters
    Mismatch(IdempotencyRecord),
}

impl IdempotentOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, IdempotentOutcome::Created)
    }

    pub fn record(&self) -> Option<&IdempotencyRecord> {
        match self {
            IdempotentOutcome::Created => None,
            IdempotentOutcome::InProgress(record)
            | IdempotentOutcome::Mismatch(record)
            | IdempotentOutcome::Completed { record, .. }
            | IdempotentOutcome::Failed { record, .. } => Some(record),
        }
    }

    /// The denial a caller should report, for outcomes that are not a
    /// go-ahead or a replay.
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            IdempotentOutcome::InProgress(record) => Some(Rejection::InProgress {
                key: record.key.clone(),
                first_seen_ms: record.first_seen_ms,
            }),
            IdempotentOutcome::Mismatch(record) => Some(Rejection::FingerprintMismatch {
                key: record.key.clone(),
                first_seen_ms: record.first_seen_ms,
            }),
            IdempotentOutcome::Failed { record, error } => Some(Rejection::PreviouslyFailed {
                key: record.key.clone(),
                error: error.clone(),
            }),
            IdempotentOutcome::Created | IdempotentOutcome::Completed { .. } => None,
        }
    }
}

/// How `execute` produced its value.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution<T> {
    /// The closure ran in this call
    Fresh(T),
    /// A stored result was replayed; `None` when the body was not stored
    Replayed(Option<T>),
}

impl<T> Execution<T> {
    pub fn is_replayed(&self) -> bool {
        matches!(self, Execution::Replayed(_))
    }

    pub fn into_inner(self) -> Option<T> {
        match self {
            Execution::Fresh(value) => Some(value),
            Execution::Replayed(value) => value,
        }
    }
}

/// The idempotency gate.
#[derive(Clone)]
pub struct IdempotencyGate {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    cache: Option<ResultCache>,
    default_timeout: Duration,
    max_result_bytes: usize,
    on_failure: FailurePolicy,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self::from_settings(store, clock, &IdempotencySettings::default())
    }

    pub fn from_settings(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        settings: &IdempotencySettings,
    ) -> Self {
        Self {
            store,
            clock,
            cache: None,
            default_timeout: Duration::from_secs(settings.default_timeout_secs),
            max_result_bytes: settings.max_result_bytes,
            on_failure: settings.on_failure,
        }
    }

    /// Serve replays of successful records from `cache` when possible.
    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    /// Claim the key for execution, or report what already happened to it.
    pub async fn begin(&self, request: &IdempotencyRequest) -> Result<IdempotentOutcome> {
        let key = request.key.to_string_key();
        let now_ms = self.clock.now_millis();

        if let Some(record) = self.cache.as_ref().and_then(|c| c.get(&key, now_ms)) {
            trace!(key = %key, "Replaying cached idempotent result");
            return Ok(classify(request, record));
        }

        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let ttl_ms = timeout.as_millis() as i64;
        if ttl_ms <= 0 {
            return Err(TurnstileError::Config(
                "idempotency timeout must be greater than zero".into(),
            ));
        }
        let record = IdempotencyRecord::pending(
            key.as_str(),
            request.key.operation.as_str(),
            request.fingerprint.as_str(),
            request.caller.clone(),
            now_ms,
            ttl_ms,
        );

        let mut retried = false;
        loop {
            let existing = match self.store.begin(&record, ttl_ms, now_ms).await? {
                BeginOutcome::Created => {
                    debug!(key = %key, ttl_ms = ttl_ms, "Created idempotency record");
                    return Ok(IdempotentOutcome::Created);
                }
                BeginOutcome::Exists(existing) => existing,
            };

            let outcome = classify(request, existing);
            match &outcome {
                IdempotentOutcome::Failed { .. }
                    if self.on_failure == FailurePolicy::Retry && !retried =>
                {
                    retried = true;
                    let removed = self
                        .store
                        .remove(&key, Some(RecordStatus::Failed), now_ms)
                        .await?;
                    info!(key = %key, removed = removed, "Retrying previously failed operation");
                    continue;
                }
                IdempotentOutcome::Completed { record, .. } => {
                    if let Some(cache) = &self.cache {
                        cache.insert(record);
                    }
                }
                _ => {}
            }
            debug!(key = %key, outcome = outcome_name(&outcome), "Idempotency record exists");
            return Ok(outcome);
        }
    }

    /// Mark the execution for `key` as succeeded with `result`.
    ///
    /// The status is recorded even when the result cannot be stored, either
    /// because it does not serialize or because it exceeds the size limit;
    /// replays then succeed without a body.
    pub async fn complete_success<T: Serialize + ?Sized>(
        &self,
        key: &GateKey,
        result: &T,
    ) -> Result<CompleteOutcome> {
        let storage_key = key.to_string_key();
        let payload = match serde_json::to_string(result) {
            Ok(body) if body.len() > self.max_result_bytes => {
                warn!(
                    key = %storage_key,
                    size = body.len(),
                    max = self.max_result_bytes,
                    "Result too large to store, recording success without it"
                );
                None
            }
            Ok(body) => Some(body),
            Err(e) => {
                warn!(
                    key = %storage_key,
                    error = %e,
                    "Result not serializable, recording success without it"
                );
                None
            }
        };
        self.finish(&storage_key, Completion::success(payload)).await
    }

    /// Mark the execution for `key` as failed with `error`.
    pub async fn complete_failure(
        &self,
        key: &GateKey,
        error: impl Display,
    ) -> Result<CompleteOutcome> {
        self.finish(&key.to_string_key(), Completion::failure(error.to_string()))
            .await
    }

    async fn finish(&self, key: &str, completion: Completion) -> Result<CompleteOutcome> {
        let now_ms = self.clock.now_millis();
        let outcome = self.store.complete(key, &completion, now_ms).await?;
        match &outcome {
            CompleteOutcome::Completed(record) => {
                debug!(key = %key, status = record.status.as_str(), "Completed idempotency record");
                if let Some(cache) = &self.cache {
                    cache.insert(record);
                }
            }
            CompleteOutcome::NotPending(record) => {
                warn!(
                    key = %key,
                    status = record.status.as_str(),
                    "Idempotency record already completed, keeping first outcome"
                );
            }
            CompleteOutcome::Missing => {
                warn!(key = %key, "Idempotency record expired before completion");
            }
        }
        Ok(outcome)
    }

    /// Run `operation` at most once for the request's key.
    ///
    /// The outer result carries gate failures and denials; the inner result
    /// is the operation's own. A fresh failure is stored and returned as the
    /// inner error. A stored success is replayed without running anything.
    pub async fn execute<T, E, F, Fut>(
        &self,
        request: &IdempotencyRequest,
        operation: F,
    ) -> Result<std::result::Result<Execution<T>, E>>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match self.begin(request).await? {
            IdempotentOutcome::Created => {}
            IdempotentOutcome::Completed { record, result } => {
                let value = match result {
                    Some(body) => Some(serde_json::from_str(&body).map_err(|e| {
                        TurnstileError::MalformedRecord {
                            key: record.key.clone(),
                            reason: format!("stored result: {}", e),
                        }
                    })?),
                    None => None,
                };
                return Ok(Ok(Execution::Replayed(value)));
            }
            other => {
                let rejection = other.rejection().ok_or_else(|| {
                    TurnstileError::Backend("unexpected idempotency outcome".into())
                })?;
                return Err(TurnstileError::Denied(rejection));
            }
        }

        match operation().await {
            Ok(value) => {
                if let Err(e) = self.complete_success(&request.key, &value).await {
                    error!(
                        key = %request.key,
                        error = %e,
                        "Failed to record idempotent success"
                    );
                }
                Ok(Ok(Execution::Fresh(value)))
            }
            Err(failure) => {
                if let Err(e) = self.complete_failure(&request.key, &failure).await {
                    error!(
                        key = %request.key,
                        error = %e,
                        "Failed to record idempotent failure"
                    );
                }
                Ok(Err(failure))
            }
        }
    }

    /// Read the live record for `key` without touching it.
    pub async fn lookup(&self, key: &GateKey) -> Result<Option<IdempotencyRecord>> {
        self.store
            .get(&key.to_string_key(), self.clock.now_millis())
            .await
    }

    /// Delete the record for `key` whatever its status.
    pub async fn forget(&self, key: &GateKey) -> Result<bool> {
        let storage_key = key.to_string_key();
        if let Some(cache) = &self.cache {
            cache.invalidate(&storage_key);
        }
        let removed = self
            .store
            .remove(&storage_key, None, self.clock.now_millis())
            .await?;
        info!(key = %storage_key, removed = removed, "Forgot idempotency record");
        Ok(removed)
    }
}

fn classify(request: &IdempotencyRequest, record: IdempotencyRecord) -> IdempotentOutcome {
    if !request.fingerprint.is_empty()
        && !record.fingerprint.is_empty()
        && request.fingerprint != record.fingerprint
    {
        return IdempotentOutcome::Mismatch(record);
    }
    match record.status {
        RecordStatus::Pending => IdempotentOutcome::InProgress(record),
        RecordStatus::Success => {
            let result = record.result.clone();
            IdempotentOutcome::Completed { record, result }
        }
        RecordStatus::Failed => {
            let error = record.error.clone().unwrap_or_default();
            IdempotentOutcome::Failed { record, error }
        }
    }
}

fn outcome_name(outcome: &IdempotentOutcome) -> &'static str {
    match outcome {
        IdempotentOutcome::Created => "created",
        IdempotentOutcome::InProgress(_) => "in_progress",
        IdempotentOutcome::Completed { .. } => "completed",
        IdempotentOutcome::Failed { .. } => "failed",
        IdempotentOutcome::Mismatch(_) => "mismatch",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::LocalStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    const T0: i64 = 1_700_000_000_000;

    fn gate() -> (IdempotencyGate, Arc<LocalStore>, Arc<ManualClock>) {
        let store = Arc::new(LocalStore::default());
        let clock = Arc::new(ManualClock::new(T0));
        let gate = IdempotencyGate::new(store.clone(), clock.clone())
            .with_default_timeout(Duration::from_secs(60));
        (gate, store, clock)
    }

    fn request(token: &str) -> IdempotencyRequest {
        IdempotencyRequest::new(GateKey::idempotency("payments.capture", token))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_begin_has_one_winner() {
        let (gate, _store, _clock) = gate();
        let begins = (0..32).map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.begin(&request("tx-1")).await })
        });
        let outcomes: Vec<IdempotentOutcome> = futures::future::join_all(begins)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        let created = outcomes.iter().filter(|o| o.is_created()).count();
        assert_eq!(created, 1);
        assert!(outcomes
            .iter()
            .filter(|o| !o.is_created())
            .all(|o| matches!(o, IdempotentOutcome::InProgress(_))));
    }

    #[tokio::test]
    async fn test_success_is_replayed() {
        let (gate, _store, clock) = gate();
        let req = request("tx-2");

        assert!(gate.begin(&req).await.unwrap().is_created());
        assert_ok!(gate.complete_success(&req.key, &serde_json::json!({"id": 7})).await);

        clock.advance(Duration::from_secs(30));
        match gate.begin(&req).await.unwrap() {
            IdempotentOutcome::Completed { record, result } => {
                assert_eq!(result.as_deref(), Some(r#"{"id":7}"#));
                assert_eq!(record.status, RecordStatus::Success);
                // begin, complete, replay
                assert_eq!(record.access_count, 3);
            }
            other => panic!("expected replay, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_record_expires_back_to_absent() {
        let (gate, _store, clock) = gate();
        let req = request("tx-3").with_timeout(Duration::from_secs(10));

        assert!(gate.begin(&req).await.unwrap().is_created());
        assert!(matches!(
            gate.begin(&req).await.unwrap(),
            IdempotentOutcome::InProgress(_)
        ));

        clock.advance(Duration::from_secs(10));
        assert!(gate.begin(&req).await.unwrap().is_created());
    }

    #[tokio::test]
    async fn test_timeout_longer_than_idle_purge_still_replays() {
        let store = Arc::new(LocalStore::new(100, Duration::from_secs(3600)));
        let clock = Arc::new(ManualClock::new(T0));
        let gate = IdempotencyGate::new(store.clone(), clock.clone());
        let req = request("tx-long").with_timeout(Duration::from_secs(7200));

        assert!(gate.begin(&req).await.unwrap().is_created());
        assert_ok!(gate.complete_success(&req.key, &"receipt").await);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(store.purge_expired(clock.now_millis()), 0);
        assert!(matches!(
            gate.begin(&req).await.unwrap(),
            IdempotentOutcome::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_failure_is_replayed_by_default() {
        let (gate, _store, _clock) = gate();
        let req = request("tx-4");

        gate.begin(&req).await.unwrap();
        gate.complete_failure(&req.key, "card declined").await.unwrap();

        let outcome = gate.begin(&req).await.unwrap();
        assert_eq!(
            outcome.rejection(),
            Some(Rejection::PreviouslyFailed {
                key: "idempotent:payments.capture:custom:tx-4".into(),
                error: "card declined".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_failure_can_be_retried() {
        let (gate, _store, _clock) = gate();
        let gate = gate.with_failure_policy(FailurePolicy::Retry);
        let req = request("tx-5");

        gate.begin(&req).await.unwrap();
        gate.complete_failure(&req.key, "timeout").await.unwrap();
        assert!(gate.begin(&req).await.unwrap().is_created());
        // the retry is in flight again
        assert!(matches!(
            gate.begin(&req).await.unwrap(),
            IdempotentOutcome::InProgress(_)
        ));
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch() {
        let (gate, _store, _clock) = gate();
        let first = request("tx-6")
            .with_params(&serde_json::json!({"amount": 10}))
            .unwrap();
        let second = request("tx-6")
            .with_params(&serde_json::json!({"amount": 99}))
            .unwrap();

        assert!(gate.begin(&first).await.unwrap().is_created());
        let outcome = gate.begin(&second).await.unwrap();
        assert!(matches!(outcome, IdempotentOutcome::Mismatch(_)));
        assert!(matches!(
            outcome.rejection(),
            Some(Rejection::FingerprintMismatch { first_seen_ms: T0, .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_result_still_succeeds() {
        let (gate, _store, _clock) = gate();
        let gate = gate.with_max_result_bytes(8);
        let req = request("tx-7");

        gate.begin(&req).await.unwrap();
        let outcome = gate
            .complete_success(&req.key, &"a result well over eight bytes")
            .await
            .unwrap();
        match outcome {
            CompleteOutcome::Completed(record) => {
                assert_eq!(record.status, RecordStatus::Success);
                assert!(record.result.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            gate.begin(&req).await.unwrap(),
            IdempotentOutcome::Completed { result: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_second_completion_keeps_first_outcome() {
        let (gate, _store, _clock) = gate();
        let req = request("tx-8");

        gate.begin(&req).await.unwrap();
        gate.complete_success(&req.key, &1).await.unwrap();
        let again = gate.complete_failure(&req.key, "late").await.unwrap();
        assert!(matches!(again, CompleteOutcome::NotPending(r) if r.status == RecordStatus::Success));

        let missing = gate
            .complete_success(&GateKey::idempotency("payments.capture", "never"), &1)
            .await
            .unwrap();
        assert_eq!(missing, CompleteOutcome::Missing);
    }

    #[tokio::test]
    async fn test_execute_runs_once() {
        let (gate, _store, _clock) = gate();
        let req = request("tx-9");
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = gate
                .execute(&req, || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(vec![1, 2, 3])
                })
                .await
                .unwrap()
                .unwrap();
            assert_eq!(result.into_inner(), Some(vec![1, 2, 3]));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_stores_failure() {
        let (gate, _store, _clock) = gate();
        let req = request("tx-10");

        let first = gate
            .execute(&req, || async { Err::<u32, _>("insufficient funds") })
            .await
            .unwrap();
        assert_eq!(first, Err("insufficient funds"));

        let second = gate
            .execute(&req, || async { Ok::<u32, &str>(1) })
            .await;
        let err = assert_err!(second);
        assert!(matches!(
            err.rejection(),
            Some(Rejection::PreviouslyFailed { error, .. }) if error == "insufficient funds"
        ));
    }

    #[tokio::test]
    async fn test_execute_while_in_flight_is_denied() {
        let (gate, _store, _clock) = gate();
        let req = request("tx-11");

        gate.begin(&req).await.unwrap();
        let err = gate
            .execute(&req, || async { Ok::<u32, String>(1) })
            .await
            .unwrap_err();
        assert!(matches!(err.rejection(), Some(Rejection::InProgress { .. })));
    }

    #[tokio::test]
    async fn test_cache_serves_replays_until_forgotten() {
        let (gate, store, _clock) = gate();
        let gate = gate.with_cache(ResultCache::new(100, Duration::from_secs(60)));
        let req = request("tx-12");

        gate.begin(&req).await.unwrap();
        gate.complete_success(&req.key, &"ok").await.unwrap();

        // drop the stored record behind the gate's back
        let storage_key = req.key.to_string_key();
        assert!(store.remove(&storage_key, None, T0).await.unwrap());
        assert!(matches!(
            gate.begin(&req).await.unwrap(),
            IdempotentOutcome::Completed { .. }
        ));

        gate.forget(&req.key).await.unwrap();
        assert!(gate.begin(&req).await.unwrap().is_created());
    }

    #[tokio::test]
    async fn test_lookup_does_not_touch() {
        let (gate, _store, _clock) = gate();
        let req = request("tx-13").with_caller("user-42");

        assert!(gate.lookup(&req.key).await.unwrap().is_none());
        gate.begin(&req).await.unwrap();
        let first = gate.lookup(&req.key).await.unwrap().unwrap();
        let second = gate.lookup(&req.key).await.unwrap().unwrap();
        assert_eq!(first.access_count, 1);
        assert_eq!(second.access_count, 1);
        assert_eq!(second.caller.as_deref(), Some("user-42"));
        assert_eq!(second.operation, "payments.capture");
    }
}

//! Rate limit algorithms.
//!
//! Each algorithm is a pure transition over its own state shape. The local
//! store runs [`evaluate`] under a per-key lock; the Redis store runs the same
//! arithmetic inside a Lua script and rebuilds the [`Verdict`] from the values
//! the script returns through the `*_verdict` functions, so both backends
//! report identically.

use std::collections::VecDeque;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Supported rate limiting algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Trailing window over the timestamps of accepted requests
    #[default]
    #[serde(alias = "SLIDING_WINDOW")]
    SlidingWindow,
    /// Counter reset at aligned window boundaries
    #[serde(alias = "FIXED_WINDOW")]
    FixedWindow,
    /// Continuously refilled tokens, one spent per request
    #[serde(alias = "TOKEN_BUCKET")]
    TokenBucket,
    /// Continuously drained water level, one unit added per request
    #[serde(alias = "LEAKY_BUCKET")]
    LeakyBucket,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sliding_window" => Ok(Algorithm::SlidingWindow),
            "fixed_window" => Ok(Algorithm::FixedWindow),
            "token_bucket" => Ok(Algorithm::TokenBucket),
            "leaky_bucket" => Ok(Algorithm::LeakyBucket),
            other => Err(TurnstileError::Config(format!(
                "unsupported rate limit algorithm: {}",
                other
            ))),
        }
    }
}

/// Longest window, or bucket recovery time, a rule may configure (ten years).
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 3600;

/// A rate limit: how many permits per window, and how they are counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitRule {
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Requests allowed per window
    pub permits: u64,
    /// Window length in seconds
    #[serde(rename = "window_seconds")]
    pub window_secs: u64,
    /// Token bucket capacity; defaults to `permits`
    #[serde(default)]
    pub bucket_capacity: Option<u64>,
    /// Token bucket refill rate in tokens per second; defaults to
    /// `permits / window_seconds`
    #[serde(default)]
    pub refill_rate: Option<f64>,
}

impl LimitRule {
    pub fn new(algorithm: Algorithm, permits: u64, window_secs: u64) -> Self {
        Self {
            algorithm,
            permits,
            window_secs,
            bucket_capacity: None,
            refill_rate: None,
        }
    }

    pub fn with_bucket_capacity(mut self, capacity: u64) -> Self {
        self.bucket_capacity = Some(capacity);
        self
    }

    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = Some(rate);
        self
    }

    /// Reject parameters no algorithm can honor.
    pub fn validate(&self) -> Result<()> {
        if self.permits == 0 {
            return Err(TurnstileError::Config("permits must be greater than zero".into()));
        }
        if self.window_secs == 0 {
            return Err(TurnstileError::Config(
                "window_seconds must be greater than zero".into(),
            ));
        }
        if self.window_secs > MAX_WINDOW_SECS {
            return Err(TurnstileError::Config(format!(
                "window_seconds must be at most {}, got {}",
                MAX_WINDOW_SECS, self.window_secs
            )));
        }
        if self.bucket_capacity == Some(0) {
            return Err(TurnstileError::Config(
                "bucket_capacity must be greater than zero".into(),
            ));
        }
        if let Some(rate) = self.refill_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(TurnstileError::Config(format!(
                    "refill_rate must be a positive number, got {}",
                    rate
                )));
            }
        }
        if self.algorithm == Algorithm::TokenBucket && self.idle_secs() > MAX_WINDOW_SECS as f64 {
            return Err(TurnstileError::Config(format!(
                "refill_rate too small: the bucket would take more than {} seconds to recover",
                MAX_WINDOW_SECS
            )));
        }
        Ok(())
    }

    pub fn window_ms(&self) -> i64 {
        (self.window_secs.min(MAX_WINDOW_SECS) as i64).saturating_mul(1000)
    }

    /// Seconds for a bucket to go from fully used back to idle.
    fn idle_secs(&self) -> f64 {
        self.capacity() / self.rate_per_sec()
    }

    /// Bucket size for the bucket algorithms.
    pub fn capacity(&self) -> f64 {
        match self.algorithm {
            Algorithm::TokenBucket => self.bucket_capacity.unwrap_or(self.permits) as f64,
            _ => self.permits as f64,
        }
    }

    /// Token refill rate or water drain rate, per second.
    pub fn rate_per_sec(&self) -> f64 {
        let per_window = self.permits as f64 / self.window_secs as f64;
        match self.algorithm {
            Algorithm::TokenBucket => self.refill_rate.unwrap_or(per_window),
            _ => per_window,
        }
    }

    /// The capacity reported to callers as `total_permits`.
    pub fn total_permits(&self) -> u64 {
        match self.algorithm {
            Algorithm::TokenBucket => self.bucket_capacity.unwrap_or(self.permits),
            _ => self.permits,
        }
    }

    /// How long state for this rule must outlive its last update.
    ///
    /// Window algorithms keep state for one window. Bucket algorithms keep it
    /// until the bucket would be back at its idle level (full of tokens, or
    /// empty of water), after which fresh state is indistinguishable.
    pub fn state_ttl_ms(&self) -> i64 {
        match self.algorithm {
            Algorithm::SlidingWindow | Algorithm::FixedWindow => self.window_ms(),
            Algorithm::TokenBucket | Algorithm::LeakyBucket => {
                let secs = self.idle_secs().ceil().clamp(1.0, MAX_WINDOW_SECS as f64);
                (secs * 1000.0) as i64
            }
        }
    }
}

/// Whether a check spends capacity or only reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Consume,
    Peek,
}

/// Outcome of one algorithm step, independent of where state lives.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub allowed: bool,
    pub remaining: u64,
    pub total: u64,
    /// Epoch milliseconds at which capacity is fully restored
    pub reset_at_ms: i64,
    /// Zero when allowed, at least one second when denied
    pub retry_after_secs: u64,
}

/// Per-key algorithm state as held by the local store.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitState {
    Sliding { stamps: VecDeque<i64> },
    Fixed { window: i64, count: u64 },
    TokenBucket { tokens: f64, last_refill_ms: i64 },
    LeakyBucket { water: f64, last_drain_ms: i64 },
}

/// Run one check against `state`.
///
/// Returns the state to persist (`None` leaves the stored state untouched)
/// and the verdict. A state of the wrong shape, left behind after the rule for
/// a key changed algorithm, is treated as absent.
pub fn evaluate(
    state: Option<LimitState>,
    rule: &LimitRule,
    now_ms: i64,
    mode: Evaluation,
) -> (Option<LimitState>, Verdict) {
    let consume = mode == Evaluation::Consume;
    match rule.algorithm {
        Algorithm::SlidingWindow => {
            let mut stamps = match state {
                Some(LimitState::Sliding { stamps }) => stamps,
                _ => VecDeque::new(),
            };
            let cutoff = now_ms - rule.window_ms();
            while stamps.front().is_some_and(|&t| t <= cutoff) {
                stamps.pop_front();
            }
            let allowed = (stamps.len() as u64) < rule.permits;
            if allowed && consume {
                let at = stamps.partition_point(|&t| t <= now_ms);
                stamps.insert(at, now_ms);
            }
            let oldest = stamps.front().copied().unwrap_or(now_ms);
            let verdict = sliding_verdict(rule, now_ms, allowed, stamps.len() as u64, oldest);
            (consume.then_some(LimitState::Sliding { stamps }), verdict)
        }
        Algorithm::FixedWindow => {
            let window = now_ms.div_euclid(rule.window_ms());
            let mut count = match state {
                Some(LimitState::Fixed { window: w, count }) if w == window => count,
                _ => 0,
            };
            let allowed = count + 1 <= rule.permits;
            if allowed && consume {
                count += 1;
            }
            let verdict = fixed_verdict(rule, now_ms, allowed, count, window);
            let next = (consume && allowed).then_some(LimitState::Fixed { window, count });
            (next, verdict)
        }
        Algorithm::TokenBucket => {
            let capacity = rule.capacity();
            let (tokens, last) = match state {
                Some(LimitState::TokenBucket {
                    tokens,
                    last_refill_ms,
                }) => (tokens, last_refill_ms),
                _ => (capacity, now_ms),
            };
            let elapsed_secs = (now_ms - last).max(0) as f64 / 1000.0;
            let mut tokens = (tokens + elapsed_secs * rule.rate_per_sec())
                .min(capacity)
                .max(0.0);
            let allowed = tokens >= 1.0;
            if allowed && consume {
                tokens = (tokens - 1.0).max(0.0);
            }
            let verdict = token_verdict(rule, now_ms, allowed, tokens);
            let next = consume.then_some(LimitState::TokenBucket {
                tokens,
                last_refill_ms: last.max(now_ms),
            });
            (next, verdict)
        }
        Algorithm::LeakyBucket => {
            let (water, last) = match state {
                Some(LimitState::LeakyBucket {
                    water,
                    last_drain_ms,
                }) => (water, last_drain_ms),
                _ => (0.0, now_ms),
            };
            let elapsed_secs = (now_ms - last).max(0) as f64 / 1000.0;
            let mut water = (water - elapsed_secs * rule.rate_per_sec()).max(0.0);
            let allowed = water < rule.capacity();
            if allowed && consume {
                water += 1.0;
            }
            let verdict = leaky_verdict(rule, now_ms, allowed, water);
            let next = consume.then_some(LimitState::LeakyBucket {
                water,
                last_drain_ms: last.max(now_ms),
            });
            (next, verdict)
        }
    }
}

fn ceil_secs(ms: i64) -> u64 {
    ((ms.max(0) + 999) / 1000) as u64
}

fn denied_retry(allowed: bool, secs: u64) -> u64 {
    if allowed {
        0
    } else {
        secs.max(1)
    }
}

/// `count` is the number of timestamps in the window after the check.
pub fn sliding_verdict(
    rule: &LimitRule,
    now_ms: i64,
    allowed: bool,
    count: u64,
    oldest_ms: i64,
) -> Verdict {
    Verdict {
        allowed,
        remaining: rule.permits.saturating_sub(count),
        total: rule.permits,
        reset_at_ms: now_ms + rule.window_ms(),
        retry_after_secs: denied_retry(allowed, ceil_secs(oldest_ms + rule.window_ms() - now_ms)),
    }
}

/// `count` is the committed counter for window index `window`.
pub fn fixed_verdict(rule: &LimitRule, now_ms: i64, allowed: bool, count: u64, window: i64) -> Verdict {
    let reset_at_ms = (window + 1) * rule.window_ms();
    Verdict {
        allowed,
        remaining: rule.permits.saturating_sub(count),
        total: rule.permits,
        reset_at_ms,
        retry_after_secs: denied_retry(allowed, ceil_secs(reset_at_ms - now_ms)),
    }
}

/// `tokens` is the token count after the check.
pub fn token_verdict(rule: &LimitRule, now_ms: i64, allowed: bool, tokens: f64) -> Verdict {
    let tokens = tokens.max(0.0);
    let rate = rule.rate_per_sec();
    let refill_ms = ((rule.capacity() - tokens).max(0.0) / rate * 1000.0).ceil() as i64;
    Verdict {
        allowed,
        remaining: tokens.floor() as u64,
        total: rule.total_permits(),
        reset_at_ms: now_ms + refill_ms,
        retry_after_secs: denied_retry(allowed, ((1.0 - tokens).max(0.0) / rate).ceil() as u64),
    }
}

/// `water` is the water level after the check.
pub fn leaky_verdict(rule: &LimitRule, now_ms: i64, allowed: bool, water: f64) -> Verdict {
    let water = water.max(0.0);
    let rate = rule.rate_per_sec();
    Verdict {
        allowed,
        remaining: (rule.capacity() - water).max(0.0).floor() as u64,
        total: rule.permits,
        reset_at_ms: now_ms + (water / rate * 1000.0).ceil() as i64,
        retry_after_secs: denied_retry(allowed, (1.0 / rate).ceil() as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    /// Run `n` consuming checks at `now`, threading state through.
    fn run(
        rule: &LimitRule,
        mut state: Option<LimitState>,
        now: i64,
        n: usize,
    ) -> (Option<LimitState>, Vec<Verdict>) {
        let mut verdicts = Vec::with_capacity(n);
        for _ in 0..n {
            let (next, verdict) = evaluate(state.clone(), rule, now, Evaluation::Consume);
            if next.is_some() {
                state = next;
            }
            verdicts.push(verdict);
        }
        (state, verdicts)
    }

    #[test]
    fn test_every_algorithm_admits_exactly_permits() {
        for algorithm in [
            Algorithm::SlidingWindow,
            Algorithm::FixedWindow,
            Algorithm::TokenBucket,
            Algorithm::LeakyBucket,
        ] {
            let rule = LimitRule::new(algorithm, 5, 10);
            let (_, verdicts) = run(&rule, None, T0, 6);
            for (i, v) in verdicts.iter().take(5).enumerate() {
                assert!(v.allowed, "{} request {} should pass", algorithm, i + 1);
            }
            assert!(!verdicts[5].allowed, "{} 6th request should be denied", algorithm);
            assert!(verdicts[5].retry_after_secs >= 1);
        }
    }

    #[test]
    fn test_fixed_window_example_scenario() {
        let rule = LimitRule::new(Algorithm::FixedWindow, 5, 30);
        // 10s into a 30s window
        let now = 30_000 * 1000 + 10_000;
        let (_, verdicts) = run(&rule, None, now, 6);
        let remaining: Vec<u64> = verdicts.iter().take(5).map(|v| v.remaining).collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);
        assert!(!verdicts[5].allowed);
        assert_eq!(verdicts[5].retry_after_secs, 20);
        assert_eq!(verdicts[5].reset_at_ms, 1_001 * 30_000);
    }

    #[test]
    fn test_fixed_window_resets_at_boundary() {
        let rule = LimitRule::new(Algorithm::FixedWindow, 3, 10);
        let window_start = 1_000 * 10_000;
        let (state, verdicts) = run(&rule, None, window_start - 1, 3);
        assert!(verdicts.iter().all(|v| v.allowed));
        let (_, denied) = evaluate(state.clone(), &rule, window_start - 1, Evaluation::Consume);
        assert!(!denied.allowed);

        let (_, fresh) = evaluate(state, &rule, window_start, Evaluation::Consume);
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 2);
    }

    #[test]
    fn test_fixed_window_denial_does_not_commit() {
        let rule = LimitRule::new(Algorithm::FixedWindow, 1, 10);
        let (state, _) = run(&rule, None, T0, 1);
        let (next, verdict) = evaluate(state.clone(), &rule, T0, Evaluation::Consume);
        assert!(!verdict.allowed);
        assert!(next.is_none());
        assert_eq!(
            state,
            Some(LimitState::Fixed {
                window: T0.div_euclid(10_000),
                count: 1
            })
        );
    }

    #[test]
    fn test_sliding_window_expires_old_entries() {
        let rule = LimitRule::new(Algorithm::SlidingWindow, 2, 10);
        let (state, _) = run(&rule, None, T0, 2);
        let (_, denied) = evaluate(state.clone(), &rule, T0 + 9_999, Evaluation::Consume);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, 1);

        let (next, admitted) = evaluate(state, &rule, T0 + 10_000, Evaluation::Consume);
        assert!(admitted.allowed);
        assert_eq!(admitted.remaining, 1);
        assert_eq!(admitted.reset_at_ms, T0 + 20_000);
        match next {
            Some(LimitState::Sliding { stamps }) => assert_eq!(stamps, vec![T0 + 10_000]),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_sliding_window_keeps_stamps_ordered() {
        let rule = LimitRule::new(Algorithm::SlidingWindow, 5, 10);
        let (state, _) = run(&rule, None, T0 + 500, 1);
        let (state, _) = run(&rule, state, T0, 1);
        match state {
            Some(LimitState::Sliding { stamps }) => {
                assert_eq!(stamps, vec![T0, T0 + 500]);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_token_bucket_refills_to_permits() {
        let rule = LimitRule::new(Algorithm::TokenBucket, 5, 10);
        let (state, _) = run(&rule, None, T0, 5);
        let (_, denied) = evaluate(state.clone(), &rule, T0, Evaluation::Consume);
        assert!(!denied.allowed);
        // refill rate is 0.5/s, so one token takes 2s
        assert_eq!(denied.retry_after_secs, 2);

        // permits / refill_rate = 10s from empty
        let later = T0 + 10_000;
        let (_, verdicts) = run(&rule, state, later, 6);
        assert_eq!(verdicts.iter().filter(|v| v.allowed).count(), 5);
        assert!(!verdicts[5].allowed);
    }

    #[test]
    fn test_token_bucket_custom_capacity_and_rate() {
        let rule = LimitRule::new(Algorithm::TokenBucket, 5, 10)
            .with_bucket_capacity(2)
            .with_refill_rate(4.0);
        let (state, verdicts) = run(&rule, None, T0, 3);
        assert_eq!(verdicts[0].total, 2);
        assert!(verdicts[1].allowed);
        assert!(!verdicts[2].allowed);

        // 250ms at 4 tokens/s buys exactly one token
        let (_, verdict) = evaluate(state, &rule, T0 + 250, Evaluation::Consume);
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 0);
    }

    #[test]
    fn test_token_bucket_never_exceeds_capacity() {
        let rule = LimitRule::new(Algorithm::TokenBucket, 3, 3);
        let (state, _) = run(&rule, None, T0, 1);
        let (next, verdict) = evaluate(state, &rule, T0 + 3_600_000, Evaluation::Peek);
        assert!(next.is_none());
        assert_eq!(verdict.remaining, 3);
        assert_eq!(verdict.reset_at_ms, T0 + 3_600_000);
    }

    #[test]
    fn test_leaky_bucket_drains() {
        let rule = LimitRule::new(Algorithm::LeakyBucket, 4, 2);
        let (state, _) = run(&rule, None, T0, 4);
        let (_, denied) = evaluate(state.clone(), &rule, T0, Evaluation::Consume);
        assert!(!denied.allowed);
        // drain rate 2/s
        assert_eq!(denied.retry_after_secs, 1);

        let (next, admitted) = evaluate(state, &rule, T0 + 500, Evaluation::Consume);
        assert!(admitted.allowed);
        match next {
            Some(LimitState::LeakyBucket { water, .. }) => assert!((water - 4.0).abs() < 1e-9),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_leaky_bucket_water_never_negative() {
        let rule = LimitRule::new(Algorithm::LeakyBucket, 2, 1);
        let (state, _) = run(&rule, None, T0, 1);
        let (next, verdict) = evaluate(state, &rule, T0 + 60_000, Evaluation::Consume);
        assert!(verdict.allowed);
        match next {
            Some(LimitState::LeakyBucket { water, .. }) => assert_eq!(water, 1.0),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_peek_does_not_consume() {
        let rule = LimitRule::new(Algorithm::SlidingWindow, 1, 10);
        let (next, verdict) = evaluate(None, &rule, T0, Evaluation::Peek);
        assert!(next.is_none());
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 1);
    }

    #[test]
    fn test_mismatched_state_is_treated_as_fresh() {
        let rule = LimitRule::new(Algorithm::FixedWindow, 2, 10);
        let stale = Some(LimitState::LeakyBucket {
            water: 100.0,
            last_drain_ms: T0,
        });
        let (_, verdict) = evaluate(stale, &rule, T0, Evaluation::Consume);
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 1);
    }

    #[test]
    fn test_validate_rejects_bad_rules() {
        assert!(LimitRule::new(Algorithm::FixedWindow, 0, 10).validate().is_err());
        assert!(LimitRule::new(Algorithm::FixedWindow, 1, 0).validate().is_err());
        assert!(LimitRule::new(Algorithm::TokenBucket, 1, 1)
            .with_bucket_capacity(0)
            .validate()
            .is_err());
        assert!(LimitRule::new(Algorithm::TokenBucket, 1, 1)
            .with_refill_rate(-1.0)
            .validate()
            .is_err());
        assert!(LimitRule::new(Algorithm::TokenBucket, 1, 1).validate().is_ok());
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("TOKEN_BUCKET".parse::<Algorithm>().unwrap(), Algorithm::TokenBucket);
        assert_eq!("leaky-bucket".parse::<Algorithm>().unwrap(), Algorithm::LeakyBucket);
        assert!("gcra".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_state_ttl() {
        assert_eq!(LimitRule::new(Algorithm::FixedWindow, 5, 30).state_ttl_ms(), 30_000);
        // 10 tokens at 0.5/s take 20s to refill
        assert_eq!(LimitRule::new(Algorithm::TokenBucket, 10, 20).state_ttl_ms(), 20_000);
        assert_eq!(LimitRule::new(Algorithm::LeakyBucket, 100, 1).state_ttl_ms(), 1_000);
    }

    #[test]
    fn test_extreme_rules_are_rejected_and_never_overflow() {
        let huge_window = LimitRule::new(Algorithm::SlidingWindow, 1, u64::MAX);
        assert!(huge_window.validate().is_err());
        assert!(huge_window.window_ms() > 0);

        let slow_refill = LimitRule::new(Algorithm::TokenBucket, 10, 60).with_refill_rate(1e-300);
        assert!(slow_refill.validate().is_err());
        assert_eq!(slow_refill.state_ttl_ms(), MAX_WINDOW_SECS as i64 * 1000);
        assert!(T0.checked_add(slow_refill.state_ttl_ms()).is_some());

        let longest = LimitRule::new(Algorithm::FixedWindow, 1, MAX_WINDOW_SECS);
        assert!(longest.validate().is_ok());
    }
}

//! Rate limiting logic and state management.

mod algorithm;
mod backend;
mod limiter;
mod rules;

pub use algorithm::{
    evaluate, fixed_verdict, leaky_verdict, sliding_verdict, token_verdict, Algorithm,
    Evaluation, LimitRule, LimitState, Verdict,
};
pub use backend::RateLimitBackend;
pub use limiter::{RateLimitResult, RateLimiter};
pub use rules::{
    IdempotencyPolicy, OperationPolicy, RateLimitPolicy, RuleRegistry, RulesDocument,
    SubmissionPolicy,
};

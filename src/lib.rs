//! Turnstile - request gating over shared, time-bounded state
//!
//! This crate bounds how often an operation may be called (rate limiting),
//! guarantees a logical operation runs at most once and replays its result
//! (idempotent execution), and blocks near-identical repeat calls within a
//! short interval (duplicate-submission suppression). State lives either in
//! process or in a shared Redis, with the same observable behavior.

pub mod clock;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod idempotency;
pub mod key;
pub mod ratelimit;
pub mod store;
pub mod submission;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TurnstileConfig;
pub use error::{Rejection, Result, TurnstileError};
pub use gatekeeper::{Gatekeeper, HealthReport};
pub use key::{fingerprint, Dimension, GateKey, GateKind};

//! Idempotent execution.
//!
//! A logical operation identified by a key runs at most once while its record
//! lives. The first caller creates a PENDING record and executes; later
//! callers see the record and either wait, replay the stored result, or get
//! the stored failure.

mod gate;

pub use gate::{Execution, FailurePolicy, IdempotencyGate, IdempotencyRequest, IdempotentOutcome};

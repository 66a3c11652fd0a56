//! Duplicate-submission suppression.

mod gate;

pub use gate::{SubmissionGate, SubmissionOutcome};

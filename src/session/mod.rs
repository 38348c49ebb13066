//! Per-user dialog sessions.

pub mod manager;

pub use manager::{CancelOutcome, SessionManager, StepOutcome};

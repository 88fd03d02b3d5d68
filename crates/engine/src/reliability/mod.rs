//! Reliability patterns for worker batches
//!
//! This module provides:
//! - [`classify`] - Failure message classification
//! - [`RateLimitPolicy`] - Shared rate-limit counters with emergency escalation
//!
//! # Escalation
//!
//! ```text
//! hit ──► consecutive += 1
//!          │
//!          ├─ wait > long_wait_secs ───────► Emergency (LongWait)
//!          ├─ consecutive >= threshold ────► Emergency (ThresholdReached)
//!          ├─ consecutive >= threshold / 2 ► Warning
//!          └─ otherwise ───────────────────► Normal
//! ```

mod classify;
mod rate_limit;

pub use classify::{
    classify, classify_error, extract_wait_secs, format_wait, is_flood_message, Classification,
};
pub use rate_limit::{
    EmergencyReason, Escalation, FailureAction, HitCounter, RateLimitPolicy, Verdict,
};

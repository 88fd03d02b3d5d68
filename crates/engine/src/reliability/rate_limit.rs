//! Cross-worker rate-limit escalation
//!
//! One [`RateLimitPolicy`] is shared (behind an `Arc`) by every worker of a
//! batch. Its counters are the only state several worker threads mutate, so
//! they live behind a single mutex: the increment and the threshold check
//! must observe the same value.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::classify::{classify, classify_error, format_wait, is_flood_message, Classification};
use crate::config::RateLimitConfig;
use crate::error::{ConfigError, JobError};

/// Why an emergency was declared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmergencyReason {
    /// One wait exceeded the long-wait limit
    LongWait { wait_secs: u64, limit_secs: u64 },

    /// Too many consecutive hits across the batch
    ThresholdReached { consecutive: u32, threshold: u32 },
}

impl std::fmt::Display for EmergencyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LongWait {
                wait_secs,
                limit_secs,
            } => write!(
                f,
                "requested wait of {} exceeds the {} limit",
                format_wait(*wait_secs),
                format_wait(*limit_secs)
            ),
            Self::ThresholdReached {
                consecutive,
                threshold,
            } => write!(
                f,
                "{consecutive} consecutive rate-limit hits reached the threshold of {threshold}"
            ),
        }
    }
}

/// Outcome of recording one rate-limit hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Below the warning level; log and carry on
    Normal { consecutive: u32 },

    /// At or above half the threshold
    Warning { consecutive: u32, threshold: u32 },

    /// The batch must stop
    Emergency(EmergencyReason),

    /// An emergency was already declared for this batch
    Halted { consecutive: u32 },
}

impl Escalation {
    /// Whether the worker that saw this hit should stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Emergency(_) | Self::Halted { .. })
    }
}

/// What a worker should do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Keep going
    Ignore,

    /// Wait this long, then retry
    RetryAfter(Duration),

    /// Stop this worker
    Abort,
}

/// Full verdict for one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// How the failure was classified
    pub classification: Classification,

    /// Escalation state, for rate-limit hits only
    pub escalation: Option<Escalation>,

    /// What the worker should do next
    pub action: FailureAction,
}

/// Which counter a hit is charged to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCounter {
    /// Generic wait limits, checked against `threshold`
    Wait,

    /// Flood-style limits, checked against `flood_threshold`
    Flood,
}

#[derive(Debug, Default)]
struct Counters {
    consecutive: u32,
    flood: u32,
    total: u64,
    emergency: bool,
}

/// Classifies failures and escalates accumulated rate-limit hits
///
/// The policy never stops workers itself; it only returns decisions. The
/// counters are reset explicitly with [`RateLimitPolicy::reset`] at the start
/// of every batch and never by a single worker finishing.
///
/// # Example
///
/// ```
/// use fleetrun_engine::{RateLimitConfig, RateLimitPolicy};
/// use fleetrun_engine::reliability::Escalation;
///
/// let policy = RateLimitPolicy::new(RateLimitConfig::default().with_threshold(2)).unwrap();
/// assert!(matches!(policy.record_hit(5), Escalation::Warning { .. }));
/// assert!(matches!(policy.record_hit(5), Escalation::Emergency(_)));
/// ```
#[derive(Debug)]
pub struct RateLimitPolicy {
    config: RateLimitConfig,
    counters: Mutex<Counters>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            config: RateLimitConfig::default(),
            counters: Mutex::new(Counters::default()),
        }
    }
}

impl RateLimitPolicy {
    /// Create a policy from a validated configuration
    pub fn new(config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            counters: Mutex::new(Counters::default()),
        })
    }

    /// The policy's configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Classify a failure message using this policy's fallback wait
    pub fn classify(&self, message: &str) -> Classification {
        classify(message, self.config.fallback_wait_secs)
    }

    /// Record a generic rate-limit hit
    pub fn record_hit(&self, wait_secs: u64) -> Escalation {
        self.record(HitCounter::Wait, wait_secs)
    }

    /// Record a flood-style hit against the secondary counter
    pub fn record_flood_hit(&self, wait_secs: u64) -> Escalation {
        self.record(HitCounter::Flood, wait_secs)
    }

    /// Record a hit against the given counter and escalate
    pub fn record(&self, counter: HitCounter, wait_secs: u64) -> Escalation {
        let mut counters = self.counters.lock();
        counters.total += 1;

        let (consecutive, threshold) = match counter {
            HitCounter::Wait => {
                counters.consecutive += 1;
                (counters.consecutive, self.config.threshold)
            }
            HitCounter::Flood => {
                counters.flood += 1;
                (counters.flood, self.config.flood_threshold)
            }
        };

        if counters.emergency {
            return Escalation::Halted { consecutive };
        }

        let escalation = if wait_secs > self.config.long_wait_secs {
            Escalation::Emergency(EmergencyReason::LongWait {
                wait_secs,
                limit_secs: self.config.long_wait_secs,
            })
        } else if consecutive >= threshold {
            Escalation::Emergency(EmergencyReason::ThresholdReached {
                consecutive,
                threshold,
            })
        } else if consecutive >= threshold / 2 {
            Escalation::Warning {
                consecutive,
                threshold,
            }
        } else {
            Escalation::Normal { consecutive }
        };

        match escalation {
            Escalation::Emergency(reason) => {
                counters.emergency = true;
                error!(?counter, %reason, "Rate-limit emergency declared");
            }
            Escalation::Warning { .. } => {
                warn!(?counter, consecutive, threshold, "Rate-limit hits approaching threshold");
            }
            _ => {
                debug!(?counter, consecutive, wait_secs, "Rate-limit hit recorded");
            }
        }

        escalation
    }

    /// Classify a failure, record it if it is a rate-limit hit, and decide
    ///
    /// Flood-style messages are charged to the flood counter when
    /// `counter` is [`HitCounter::Flood`]; everything else to the wait counter.
    pub fn evaluate(&self, message: &str, counter: HitCounter) -> Verdict {
        let classification = self.classify(message);
        self.decide(classification, message, counter)
    }

    /// Same as [`evaluate`](Self::evaluate), classifying by error variant first
    ///
    /// A [`JobError::Transport`] stays a transport error even when its text
    /// matches none of the transport phrases.
    pub fn evaluate_error(&self, err: &JobError, counter: HitCounter) -> Verdict {
        let classification = classify_error(err, self.config.fallback_wait_secs);
        self.decide(classification, &err.to_string(), counter)
    }

    fn decide(&self, classification: Classification, message: &str, counter: HitCounter) -> Verdict {
        let (escalation, action) = match classification {
            Classification::FloodWait(wait_secs) => {
                let counter = match counter {
                    HitCounter::Flood if is_flood_message(message) => {
                        HitCounter::Flood
                    }
                    _ => HitCounter::Wait,
                };
                let escalation = self.record(counter, wait_secs);
                let action = if escalation.is_fatal() {
                    FailureAction::Abort
                } else {
                    FailureAction::RetryAfter(Duration::from_secs(wait_secs))
                };
                (Some(escalation), action)
            }
            Classification::Unauthorized
            | Classification::Blocked
            | Classification::Deactivated => (None, FailureAction::Abort),
            Classification::TransportError => (
                None,
                FailureAction::RetryAfter(Duration::from_secs(self.config.fallback_wait_secs)),
            ),
            Classification::Other => (None, FailureAction::Ignore),
        };

        Verdict {
            classification,
            escalation,
            action,
        }
    }

    /// Zero the consecutive counters and clear the emergency latch
    ///
    /// `total_hits` is kept.
    pub fn reset(&self) {
        let mut counters = self.counters.lock();
        counters.consecutive = 0;
        counters.flood = 0;
        counters.emergency = false;
        debug!("Rate-limit counters reset");
    }

    /// Consecutive generic hits since the last reset
    pub fn consecutive_count(&self) -> u32 {
        self.counters.lock().consecutive
    }

    /// Consecutive flood hits since the last reset
    pub fn flood_count(&self) -> u32 {
        self.counters.lock().flood
    }

    /// Every hit ever recorded
    pub fn total_hits(&self) -> u64 {
        self.counters.lock().total
    }

    /// Whether an emergency has been declared since the last reset
    pub fn is_emergency(&self) -> bool {
        self.counters.lock().emergency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn policy(threshold: u32) -> RateLimitPolicy {
        RateLimitPolicy::new(RateLimitConfig::default().with_threshold(threshold)).unwrap()
    }

    #[test]
    fn test_emergency_on_threshold_hit_only() {
        let policy = policy(15);
        let mut emergencies = 0;
        for hit in 1..=15 {
            let escalation = policy.record_hit(5);
            if let Escalation::Emergency(reason) = escalation {
                emergencies += 1;
                assert_eq!(hit, 15, "emergency before the 15th hit");
                assert_eq!(
                    reason,
                    EmergencyReason::ThresholdReached {
                        consecutive: 15,
                        threshold: 15
                    }
                );
            }
        }
        assert_eq!(emergencies, 1);
        assert!(policy.is_emergency());
    }

    #[test]
    fn test_warning_from_half_threshold() {
        let policy = policy(15);
        for _ in 1..7 {
            assert!(matches!(policy.record_hit(5), Escalation::Normal { .. }));
        }
        assert_eq!(
            policy.record_hit(5),
            Escalation::Warning {
                consecutive: 7,
                threshold: 15
            }
        );
    }

    #[test]
    fn test_long_wait_override() {
        let policy = policy(15);
        assert_eq!(
            policy.record_hit(7200),
            Escalation::Emergency(EmergencyReason::LongWait {
                wait_secs: 7200,
                limit_secs: 3600
            })
        );
        assert_eq!(policy.consecutive_count(), 1);
    }

    #[test]
    fn test_long_wait_at_limit_is_not_emergency() {
        let policy = policy(15);
        assert!(matches!(policy.record_hit(3600), Escalation::Normal { .. }));
    }

    #[test]
    fn test_emergency_latches_until_reset() {
        let policy = policy(2);
        policy.record_hit(5);
        assert!(matches!(policy.record_hit(5), Escalation::Emergency(_)));
        assert_eq!(
            policy.record_hit(5),
            Escalation::Halted { consecutive: 3 }
        );
        assert!(policy.record_hit(9999).is_fatal());

        policy.reset();
        assert!(!policy.is_emergency());
        assert_eq!(policy.total_hits(), 4);
    }

    #[test]
    fn test_reset_semantics() {
        let policy = policy(15);
        for _ in 0..10 {
            policy.record_hit(5);
        }
        policy.reset();
        assert_eq!(policy.consecutive_count(), 0);
        assert_eq!(policy.record_hit(5), Escalation::Normal { consecutive: 1 });
    }

    #[test]
    fn test_flood_counter_is_independent() {
        let policy = policy(15);
        for _ in 0..9 {
            policy.record_flood_hit(5);
        }
        assert_eq!(policy.consecutive_count(), 0);
        assert!(matches!(
            policy.record_flood_hit(5),
            Escalation::Emergency(EmergencyReason::ThresholdReached {
                consecutive: 10,
                threshold: 10
            })
        ));
    }

    #[test]
    fn test_evaluate_actions() {
        let policy = policy(15);

        let verdict = policy.evaluate("A wait of 30 seconds is required", HitCounter::Wait);
        assert_eq!(verdict.classification, Classification::FloodWait(30));
        assert_eq!(
            verdict.action,
            FailureAction::RetryAfter(Duration::from_secs(30))
        );
        assert_eq!(
            verdict.escalation,
            Some(Escalation::Normal { consecutive: 1 })
        );

        let verdict = policy.evaluate("USER_DEACTIVATED", HitCounter::Wait);
        assert_eq!(verdict.action, FailureAction::Abort);
        assert!(verdict.escalation.is_none());

        let verdict = policy.evaluate("Connection reset by peer", HitCounter::Wait);
        assert_eq!(
            verdict.action,
            FailureAction::RetryAfter(Duration::from_secs(5))
        );

        let verdict = policy.evaluate("chat not found", HitCounter::Wait);
        assert_eq!(verdict.action, FailureAction::Ignore);
        assert_eq!(policy.consecutive_count(), 1);
    }

    #[test]
    fn test_evaluate_error_retries_transport_variant() {
        let policy = policy(15);
        let err: JobError =
            std::io::Error::new(std::io::ErrorKind::NetworkUnreachable, "network unreachable").into();
        let verdict = policy.evaluate_error(&err, HitCounter::Wait);
        assert_eq!(verdict.classification, Classification::TransportError);
        assert_eq!(verdict.escalation, None);
        assert_eq!(verdict.action, FailureAction::RetryAfter(Duration::from_secs(5)));
        assert_eq!(policy.total_hits(), 0);

        let verdict = policy.evaluate_error(&JobError::Cancelled, HitCounter::Wait);
        assert_eq!(verdict.action, FailureAction::Ignore);

        let verdict = policy.evaluate_error(&JobError::remote("FLOOD_WAIT_30"), HitCounter::Flood);
        assert_eq!(verdict.classification, Classification::FloodWait(30));
        assert_eq!(policy.flood_count(), 1);
    }

    #[test]
    fn test_evaluate_routes_flood_messages() {
        let policy = policy(15);
        policy.evaluate("FLOOD_WAIT_12", HitCounter::Flood);
        policy.evaluate("A wait of 12 seconds is required", HitCounter::Flood);
        assert_eq!(policy.flood_count(), 1);
        assert_eq!(policy.consecutive_count(), 1);
    }

    #[test]
    fn test_evaluate_aborts_on_emergency() {
        let policy = policy(15);
        let verdict = policy.evaluate("A wait of 7200 seconds is required", HitCounter::Wait);
        assert_eq!(verdict.action, FailureAction::Abort);
    }

    #[test]
    fn test_concurrent_hits_yield_one_emergency() {
        let policy = Arc::new(policy(15));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let policy = policy.clone();
                std::thread::spawn(move || {
                    (0..5)
                        .filter(|_| matches!(policy.record_hit(5), Escalation::Emergency(_)))
                        .count()
                })
            })
            .collect();

        let emergencies: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(emergencies, 1);
        assert_eq!(policy.consecutive_count(), 40);
    }
}

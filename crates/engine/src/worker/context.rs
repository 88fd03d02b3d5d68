//! Job body execution context

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::event::{EventSink, WorkerEventKind};
use super::WorkerId;
use crate::delay::DelayGenerator;
use crate::error::{Cancelled, JobError};
use crate::reliability::{
    format_wait, Classification, Escalation, FailureAction, HitCounter, RateLimitPolicy,
};

/// Context provided to a job body while it runs
///
/// The context provides:
/// - The worker's identity and id
/// - Cooperative cancellation (`is_cancelled`, `cancelled`)
/// - Event emission (`log`, `progress`)
/// - Interruptible pacing (`apply_delay`, `sleep`)
/// - Rate-limit handling through the batch's shared policy (`handle_failure`)
///
/// Cheap to clone; clones share the same worker.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    worker_id: WorkerId,
    identity: Arc<str>,
    cancel: CancellationToken,
    delay: DelayGenerator,
    policy: Option<Arc<RateLimitPolicy>>,
    sink: EventSink,
}

impl WorkerContext {
    pub(crate) fn new(
        worker_id: WorkerId,
        identity: Arc<str>,
        cancel: CancellationToken,
        delay: DelayGenerator,
        policy: Option<Arc<RateLimitPolicy>>,
        sink: EventSink,
    ) -> Self {
        Self {
            worker_id,
            identity,
            cancel,
            delay,
            policy,
            sink,
        }
    }

    /// The worker's id
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// The identity this worker runs for
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The shared rate-limit policy, if the worker was given one
    pub fn policy(&self) -> Option<&Arc<RateLimitPolicy>> {
        self.policy.as_ref()
    }

    /// Check if a stop was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once a stop is requested
    ///
    /// Useful in `select!` to bound the job body's own network waits.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// `Err(Cancelled)` if a stop was requested, for use with `?`
    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Emit a log line
    pub fn log(&self, text: impl Into<String>) {
        self.sink.emit(WorkerEventKind::Log { text: text.into() });
    }

    /// Emit a progress report; `percent` is capped at 100
    pub fn progress(&self, percent: u8, status: impl Into<String>) {
        self.sink.emit(WorkerEventKind::Progress {
            percent: percent.min(100),
            status: status.into(),
        });
    }

    /// Wait a freshly drawn pacing delay
    ///
    /// Emits the drawn delay as a `Delay` event before waiting and `Delay { 0 }`
    /// after, so hosts can show a live countdown. Returns the drawn seconds.
    pub async fn apply_delay(&self) -> Result<u64, Cancelled> {
        let secs = self.delay.draw();
        if secs == 0 {
            self.check_cancelled()?;
            return Ok(0);
        }

        debug!(delay_secs = secs, "Applying pacing delay");
        self.sink.emit(WorkerEventKind::Delay { secs });
        let waited = self.delay.wait(secs, &self.cancel).await;
        self.sink.emit(WorkerEventKind::Delay { secs: 0 });
        waited.map(|_| secs)
    }

    /// Interruptible sleep
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(Cancelled),
        }
    }

    /// Classify a failure, feed rate-limit hits to the shared policy and decide
    ///
    /// Emits a log line for every classified failure, plus a
    /// `RateLimitWarning` or `Emergency` event when the policy escalates.
    /// Without a policy, every failure is [`FailureAction::Abort`].
    pub fn handle_failure(&self, err: &JobError) -> FailureAction {
        self.handle_failure_with(err, HitCounter::Wait)
    }

    /// Same as [`handle_failure`](Self::handle_failure), charging flood-style
    /// messages to the policy's flood counter
    pub fn handle_flood_failure(&self, err: &JobError) -> FailureAction {
        self.handle_failure_with(err, HitCounter::Flood)
    }

    fn handle_failure_with(&self, err: &JobError, counter: HitCounter) -> FailureAction {
        let Some(policy) = &self.policy else {
            self.log(format!("Failed: {err}"));
            return FailureAction::Abort;
        };

        let message = err.to_string();
        let verdict = policy.evaluate_error(err, counter);

        match (verdict.classification, verdict.escalation) {
            (Classification::FloodWait(wait_secs), Some(escalation)) => {
                self.report_rate_limit(wait_secs, escalation);
            }
            (classification, _) => {
                warn!(%classification, error = %message, "Job failure classified");
                self.log(format!("{classification}: {message}"));
            }
        }

        verdict.action
    }

    fn report_rate_limit(&self, wait_secs: u64, escalation: Escalation) {
        let wait = format_wait(wait_secs);
        match escalation {
            Escalation::Normal { consecutive } => {
                self.log(format!(
                    "Rate limited, waiting {wait} (hit {consecutive} in a row)"
                ));
            }
            Escalation::Warning {
                consecutive,
                threshold,
            } => {
                self.log(format!(
                    "Rate limited, waiting {wait} (hit {consecutive} of {threshold} before emergency stop)"
                ));
                self.sink.emit(WorkerEventKind::RateLimitWarning {
                    consecutive,
                    threshold,
                });
            }
            Escalation::Emergency(reason) => {
                self.log(format!("Rate limited ({wait}): emergency stop, {reason}"));
                self.sink.emit(WorkerEventKind::Emergency { reason });
            }
            Escalation::Halted { .. } => {
                self.log(format!("Rate limited ({wait}) after emergency stop"));
            }
        }
    }
}

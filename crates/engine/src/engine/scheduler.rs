//! Staggered launch scheduler
//!
//! Turns a batch of workers into a strictly sequential, randomly paced
//! launch sequence. Launched workers run concurrently; only their start
//! times are staggered.
//!
//! ```text
//!          start_all
//! Empty ─────────────► Launching(current, delay_remaining)
//!   ▲                     │   tick: delay_remaining -= 1
//!   │                     │   finished(current): current = None
//!   │                     ▼
//!   └──── pending empty ◄─ next launch once the delay has elapsed
//!                          AND current has finished (whichever is last)
//! ```
//!
//! A drawn delay of zero launches the next worker straight away.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::ExecutionEngine;
use crate::config::DelayRange;
use crate::delay::DelayGenerator;
use crate::error::ConfigError;
use crate::worker::{Worker, WorkerId};

const TICK: Duration = Duration::from_secs(1);

/// Events emitted by the scheduler for the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A worker was handed to the engine and started
    Launched { worker_id: WorkerId, identity: String },

    /// The engine could not start a worker; the sequence continues
    LaunchFailed { identity: String, error: String },

    /// Seconds left before the next launch; `0` resets the countdown display
    Delay { secs: u64 },
}

/// Sequential launcher with a random pause between launches
pub struct LaunchScheduler {
    generator: DelayGenerator,
    pending: VecDeque<Worker>,
    current: Option<WorkerId>,
    delay_remaining: u64,
    ticker: Option<Interval>,
    outbox: VecDeque<SchedulerEvent>,
    idle_reported: bool,
}

impl Default for LaunchScheduler {
    fn default() -> Self {
        Self::from_range(DelayRange::none())
    }
}

impl LaunchScheduler {
    /// Create a scheduler pausing `[min_secs, max_secs]` between launches
    pub fn new(min_secs: u64, max_secs: u64) -> Result<Self, ConfigError> {
        Ok(Self::from_range(DelayRange::new(min_secs, max_secs)?))
    }

    pub fn from_range(range: DelayRange) -> Self {
        Self {
            generator: DelayGenerator::from_range(range),
            pending: VecDeque::new(),
            current: None,
            delay_remaining: 0,
            ticker: None,
            outbox: VecDeque::new(),
            idle_reported: false,
        }
    }

    /// Change the launch delay range; applies to the next draw
    pub fn configure(&mut self, min_secs: u64, max_secs: u64) -> Result<(), ConfigError> {
        self.generator.configure(min_secs, max_secs)
    }

    pub fn range(&self) -> DelayRange {
        self.generator.range()
    }

    /// Queue workers behind any already pending
    ///
    /// Does not disturb an in-flight wait.
    pub fn add_threads(&mut self, workers: impl IntoIterator<Item = Worker>) {
        let before = self.pending.len();
        self.pending.extend(workers);
        let added = self.pending.len() - before;
        if added > 0 {
            self.idle_reported = false;
            debug!(added, pending = self.pending.len(), "Workers queued for launch");
        }
    }

    /// Launch the head of the queue if nothing is launching
    pub fn start_all(&mut self, engine: &mut ExecutionEngine) {
        if self.current.is_none() && !self.is_counting_down() && !self.pending.is_empty() {
            info!(pending = self.pending.len(), range = ?self.range(), "Starting staggered launch");
            self.launch_next(engine);
        }
    }

    /// One-second tick of the countdown
    ///
    /// Normally driven by [`next_tick`](Self::next_tick); hosts with their
    /// own timer may call it directly.
    pub fn tick(&mut self, engine: &mut ExecutionEngine) {
        if self.delay_remaining > 0 {
            self.delay_remaining -= 1;
            self.outbox.push_back(SchedulerEvent::Delay {
                secs: self.delay_remaining,
            });
        }
        if self.delay_remaining == 0 {
            self.ticker = None;
            if self.current.is_none() {
                self.launch_next(engine);
            }
        }
    }

    /// Notify the scheduler that a worker finished
    ///
    /// Only the current worker matters. If no countdown is running the next
    /// launch happens immediately.
    pub fn on_worker_finished(&mut self, engine: &mut ExecutionEngine, worker_id: WorkerId) {
        if self.current != Some(worker_id) {
            return;
        }
        self.current = None;
        if !self.is_counting_down() {
            self.launch_next(engine);
        }
    }

    /// Abandon the launch sequence
    ///
    /// Pending workers are dropped unstarted. Already launched workers keep
    /// running; stopping them is the engine's job. Returns the number of
    /// workers dropped.
    pub fn stop(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.current = None;
        self.delay_remaining = 0;
        self.ticker = None;
        self.outbox.push_back(SchedulerEvent::Delay { secs: 0 });
        self.idle_reported = true;
        info!(dropped, "Launch sequence stopped");
        dropped
    }

    /// Resolves on the next countdown tick; pending forever without one
    ///
    /// Cancel-safe.
    pub async fn next_tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    pub fn is_counting_down(&self) -> bool {
        self.delay_remaining > 0
    }

    /// Nothing pending and nothing launching
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.current.is_none()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn delay_remaining(&self) -> u64 {
        self.delay_remaining
    }

    /// The worker most recently launched, until it finishes
    pub fn current(&self) -> Option<WorkerId> {
        self.current
    }

    /// Take the next queued event
    pub fn pop_event(&mut self) -> Option<SchedulerEvent> {
        self.outbox.pop_front()
    }

    /// Take all queued events
    pub fn drain_events(&mut self) -> impl Iterator<Item = SchedulerEvent> + '_ {
        self.outbox.drain(..)
    }

    fn launch_next(&mut self, engine: &mut ExecutionEngine) {
        while let Some(worker) = self.pending.pop_front() {
            let identity = worker.identity().to_string();
            match engine.start(worker) {
                Ok(worker_id) => {
                    debug!(worker_id = %worker_id, identity = %identity, pending = self.pending.len(), "Worker launched");
                    self.current = Some(worker_id);
                    self.outbox.push_back(SchedulerEvent::Launched {
                        worker_id,
                        identity,
                    });
                }
                Err(e) => {
                    error!(identity = %identity, error = %e, "Launch failed, moving on");
                    self.outbox.push_back(SchedulerEvent::LaunchFailed {
                        identity,
                        error: e.to_string(),
                    });
                    continue;
                }
            }

            if self.pending.is_empty() {
                return;
            }

            let secs = self.generator.draw();
            if secs == 0 {
                continue;
            }

            self.delay_remaining = secs;
            self.outbox.push_back(SchedulerEvent::Delay { secs });
            let mut ticker = tokio::time::interval_at(Instant::now() + TICK, TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.ticker = Some(ticker);
            debug!(delay_secs = secs, "Next launch scheduled");
            return;
        }

        self.report_idle();
    }

    fn report_idle(&mut self) {
        if self.is_idle() && !self.idle_reported {
            self.idle_reported = true;
            self.ticker = None;
            self.outbox.push_back(SchedulerEvent::Delay { secs: 0 });
            info!("Launch sequence complete");
        }
    }
}

impl std::fmt::Debug for LaunchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchScheduler")
            .field("range", &self.range())
            .field("pending", &self.pending.len())
            .field("current", &self.current)
            .field("delay_remaining", &self.delay_remaining)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parked(identity: &str) -> Worker {
        Worker::from_fn(identity, |ctx| async move {
            ctx.cancelled().await;
            Ok(())
        })
    }

    fn batch(n: usize) -> Vec<Worker> {
        (0..n).map(|i| parked(&format!("acct-{i}"))).collect()
    }

    fn launched(events: &[SchedulerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::Launched { .. }))
            .count()
    }

    #[test]
    fn test_invalid_range() {
        assert!(matches!(
            LaunchScheduler::new(10, 3),
            Err(ConfigError::InvalidRange { min: 10, max: 3 })
        ));
        let mut scheduler = LaunchScheduler::default();
        assert!(scheduler.configure(5, 1).is_err());
        assert!(scheduler.range().is_disabled());
    }

    #[tokio::test]
    async fn test_zero_delay_launches_everything() {
        let mut engine = ExecutionEngine::new();
        let mut scheduler = LaunchScheduler::default();
        scheduler.add_threads(batch(3));
        scheduler.start_all(&mut engine);

        let events: Vec<_> = scheduler.drain_events().collect();
        assert_eq!(launched(&events), 3);
        assert_eq!(engine.active_count(), 3);
        assert_eq!(scheduler.pending_count(), 0);
        assert!(!scheduler.is_counting_down());

        engine.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_launch_waits_for_delay_and_finish() {
        let mut engine = ExecutionEngine::new();
        let mut scheduler = LaunchScheduler::from_range(DelayRange::fixed(2));
        scheduler.add_threads(batch(3));
        scheduler.start_all(&mut engine);

        let first = scheduler.current().unwrap();
        let events: Vec<_> = scheduler.drain_events().collect();
        assert_eq!(launched(&events), 1);
        assert_eq!(events.last(), Some(&SchedulerEvent::Delay { secs: 2 }));

        scheduler.tick(&mut engine);
        scheduler.tick(&mut engine);
        let events: Vec<_> = scheduler.drain_events().collect();
        assert_eq!(
            events,
            vec![
                SchedulerEvent::Delay { secs: 1 },
                SchedulerEvent::Delay { secs: 0 }
            ]
        );
        // Delay elapsed, first worker still running.
        assert_eq!(engine.active_count(), 1);

        scheduler.on_worker_finished(&mut engine, first);
        assert_eq!(engine.active_count(), 2);
        assert_ne!(scheduler.current(), Some(first));
        assert_eq!(scheduler.delay_remaining(), 2);

        engine.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_finish_waits_for_delay() {
        let mut engine = ExecutionEngine::new();
        let mut scheduler = LaunchScheduler::from_range(DelayRange::fixed(2));
        scheduler.add_threads(batch(2));
        scheduler.start_all(&mut engine);

        let first = scheduler.current().unwrap();
        scheduler.on_worker_finished(&mut engine, first);
        assert_eq!(engine.active_count(), 1);
        assert!(scheduler.is_counting_down());

        scheduler.tick(&mut engine);
        assert_eq!(engine.active_count(), 1);
        scheduler.tick(&mut engine);
        assert_eq!(engine.active_count(), 2);
        assert_eq!(scheduler.pending_count(), 0);

        engine.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_tick_follows_countdown() {
        let mut engine = ExecutionEngine::new();
        let mut scheduler = LaunchScheduler::from_range(DelayRange::fixed(3));
        scheduler.add_threads(batch(2));
        scheduler.start_all(&mut engine);
        scheduler.drain_events().for_each(drop);

        let started = Instant::now();
        scheduler.next_tick().await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        scheduler.tick(&mut engine);
        assert_eq!(scheduler.pop_event(), Some(SchedulerEvent::Delay { secs: 2 }));

        engine.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_threads_during_countdown() {
        let mut engine = ExecutionEngine::new();
        let mut scheduler = LaunchScheduler::from_range(DelayRange::fixed(5));
        scheduler.add_threads(batch(2));
        scheduler.start_all(&mut engine);
        scheduler.tick(&mut engine);

        scheduler.add_threads(batch(2));
        scheduler.start_all(&mut engine);
        assert_eq!(scheduler.delay_remaining(), 4);
        assert_eq!(scheduler.pending_count(), 3);
        assert_eq!(engine.active_count(), 1);

        engine.stop_all();
    }

    #[tokio::test]
    async fn test_launch_failure_keeps_current() {
        let mut engine = ExecutionEngine::new();
        let mut scheduler = LaunchScheduler::default();

        // Started outside the engine, so the engine cannot start it again.
        let mut taken = parked("acct-taken");
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        taken.start(tx).unwrap();
        let taken_handle = taken.handle();

        scheduler.add_threads(vec![parked("acct-0"), taken]);
        scheduler.start_all(&mut engine);
        let first = scheduler.current().unwrap();

        let events: Vec<_> = scheduler.drain_events().collect();
        assert_eq!(launched(&events), 1);
        assert!(matches!(
            events.last(),
            Some(SchedulerEvent::LaunchFailed { identity, .. }) if identity == "acct-taken"
        ));
        assert_eq!(scheduler.current(), Some(first));
        assert!(!scheduler.is_idle());

        scheduler.on_worker_finished(&mut engine, first);
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.pop_event(), Some(SchedulerEvent::Delay { secs: 0 }));

        taken_handle.stop();
        engine.stop_all();
    }

    #[tokio::test]
    async fn test_idle_reported_once() {
        let mut engine = ExecutionEngine::new();
        let mut scheduler = LaunchScheduler::default();
        scheduler.add_threads(batch(1));
        scheduler.start_all(&mut engine);
        let only = scheduler.current().unwrap();
        scheduler.drain_events().for_each(drop);

        scheduler.on_worker_finished(&mut engine, only);
        scheduler.on_worker_finished(&mut engine, only);
        scheduler.start_all(&mut engine);
        scheduler.tick(&mut engine);

        let events: Vec<_> = scheduler.drain_events().collect();
        assert_eq!(events, vec![SchedulerEvent::Delay { secs: 0 }]);
        assert!(scheduler.is_idle());

        engine.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_pending() {
        let mut engine = ExecutionEngine::new();
        let mut scheduler = LaunchScheduler::from_range(DelayRange::fixed(10));
        scheduler.add_threads(batch(4));
        scheduler.start_all(&mut engine);
        scheduler.drain_events().for_each(drop);

        assert_eq!(scheduler.stop(), 3);
        assert!(scheduler.is_idle());
        assert!(!scheduler.is_counting_down());
        assert_eq!(scheduler.pop_event(), Some(SchedulerEvent::Delay { secs: 0 }));
        assert_eq!(scheduler.pop_event(), None);
        // Launched worker is untouched.
        assert_eq!(engine.active_count(), 1);

        scheduler.tick(&mut engine);
        assert_eq!(engine.active_count(), 1);
        assert_eq!(scheduler.pop_event(), None);

        engine.stop_all();
    }
}

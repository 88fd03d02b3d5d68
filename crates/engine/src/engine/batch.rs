//! Batch coordinator
//!
//! One feature run: an engine, a launch scheduler, and the rate-limit
//! policy shared by every worker of the run. The host drives it by
//! awaiting [`Batch::next_event`] on the coordinating thread.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::{ExecutionEngine, LaunchScheduler, SchedulerEvent};
use crate::config::EngineConfig;
use crate::error::{EngineError, JobError};
use crate::reliability::RateLimitPolicy;
use crate::worker::{Job, Worker, WorkerContext, WorkerEvent, WorkerEventKind, WorkerId};

/// Everything a batch reports to its host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Worker(WorkerEvent),
    Scheduler(SchedulerEvent),
}

impl BatchEvent {
    /// The worker event, if this is one
    pub fn as_worker(&self) -> Option<&WorkerEvent> {
        match self {
            Self::Worker(event) => Some(event),
            Self::Scheduler(_) => None,
        }
    }
}

/// A coordinated run of workers sharing one rate-limit policy
///
/// # Example
///
/// ```ignore
/// let mut batch = Batch::new(EngineConfig::from_env()?)?;
/// batch.reset_rate_limits();
///
/// let workers = sessions
///     .into_iter()
///     .map(|session| batch.worker(session.name.clone(), SendMessages::new(session)))
///     .collect::<Vec<_>>();
/// batch.launch_staggered(workers);
///
/// while let Some(event) = batch.next_event().await {
///     render(event);
/// }
/// ```
pub struct Batch {
    config: EngineConfig,
    policy: Arc<RateLimitPolicy>,
    engine: ExecutionEngine,
    scheduler: LaunchScheduler,
    outbox: VecDeque<BatchEvent>,
    emergency_stopped: bool,
}

impl Batch {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let policy = Arc::new(RateLimitPolicy::new(config.rate_limit.clone())?);
        let scheduler = LaunchScheduler::from_range(config.launch_delay);
        Ok(Self {
            config,
            policy,
            engine: ExecutionEngine::new(),
            scheduler,
            outbox: VecDeque::new(),
            emergency_stopped: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The policy shared by workers built through this batch
    pub fn policy(&self) -> &Arc<RateLimitPolicy> {
        &self.policy
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ExecutionEngine {
        &mut self.engine
    }

    pub fn scheduler(&self) -> &LaunchScheduler {
        &self.scheduler
    }

    /// Build a worker wired to this batch's policy and action delay
    pub fn worker(&self, identity: impl Into<String>, job: impl Job) -> Worker {
        Worker::new(identity, job)
            .with_delay(self.config.action_delay)
            .with_policy(self.policy.clone())
    }

    /// Closure form of [`worker`](Self::worker)
    pub fn worker_fn<F, Fut>(&self, identity: impl Into<String>, f: F) -> Worker
    where
        F: FnOnce(WorkerContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + 'static,
    {
        Worker::from_fn(identity, f)
            .with_delay(self.config.action_delay)
            .with_policy(self.policy.clone())
    }

    /// Zero the shared rate-limit counters; call before every new run
    pub fn reset_rate_limits(&mut self) {
        self.policy.reset();
        self.emergency_stopped = false;
    }

    /// Whether the shared policy has declared an emergency
    pub fn is_emergency(&self) -> bool {
        self.policy.is_emergency()
    }

    /// Start every worker at once
    ///
    /// Returns the ids of the workers that started. Launch failures are
    /// reported as [`SchedulerEvent::LaunchFailed`].
    pub fn launch_parallel(&mut self, workers: impl IntoIterator<Item = Worker>) -> Vec<WorkerId> {
        let mut started = Vec::new();
        for worker in workers {
            let identity = worker.identity().to_string();
            match self.engine.start(worker) {
                Ok(worker_id) => {
                    self.outbox
                        .push_back(BatchEvent::Scheduler(SchedulerEvent::Launched {
                            worker_id,
                            identity,
                        }));
                    started.push(worker_id);
                }
                Err(e) => {
                    self.outbox
                        .push_back(BatchEvent::Scheduler(SchedulerEvent::LaunchFailed {
                            identity,
                            error: e.to_string(),
                        }));
                }
            }
        }
        info!(started = started.len(), "Parallel launch");
        started
    }

    /// Queue workers for staggered launch and start the sequence
    pub fn launch_staggered(&mut self, workers: impl IntoIterator<Item = Worker>) {
        self.scheduler.add_threads(workers);
        self.scheduler.start_all(&mut self.engine);
    }

    /// Stop the launch sequence and every active worker
    ///
    /// Does not wait; keep draining [`next_event`](Self::next_event) to see
    /// the workers finish.
    pub fn stop(&mut self) {
        let dropped = self.scheduler.stop();
        let stopping = self.engine.stop_all();
        info!(dropped, stopping, "Batch stop requested");
    }

    /// Next event for the host
    ///
    /// Drives the launch countdown while waiting. Returns `None` once no
    /// worker is active, no launch is pending and every event was delivered.
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        loop {
            if let Some(event) = self.scheduler.pop_event() {
                return Some(BatchEvent::Scheduler(event));
            }
            if let Some(event) = self.outbox.pop_front() {
                return Some(event);
            }
            if let Some(event) = self.engine.try_next_event() {
                return Some(self.observe(event));
            }

            if self.engine.is_all_finished() {
                if !self.scheduler.is_counting_down() {
                    return None;
                }
                self.scheduler.next_tick().await;
                self.scheduler.tick(&mut self.engine);
                continue;
            }

            tokio::select! {
                event = self.engine.next_event() => {
                    if let Some(event) = event {
                        return Some(self.observe(event));
                    }
                }
                _ = self.scheduler.next_tick() => {
                    self.scheduler.tick(&mut self.engine);
                }
            }
        }
    }

    fn observe(&mut self, event: WorkerEvent) -> BatchEvent {
        match &event.kind {
            WorkerEventKind::Finished => {
                self.scheduler
                    .on_worker_finished(&mut self.engine, event.worker_id);
            }
            WorkerEventKind::Emergency { reason } => {
                if self.config.stop_on_emergency && !self.emergency_stopped {
                    error!(%reason, identity = %event.identity, "Emergency stop of the batch");
                    self.emergency_stopped = true;
                    self.stop();
                } else if !self.config.stop_on_emergency {
                    warn!(%reason, "Emergency raised, waiting for the host to stop the batch");
                }
            }
            _ => {}
        }
        BatchEvent::Worker(event)
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("engine", &self.engine)
            .field("scheduler", &self.scheduler)
            .field("emergency", &self.is_emergency())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DelayRange, RateLimitConfig};
    use crate::error::ConfigError;
    use std::time::Duration;

    async fn collect(batch: &mut Batch) -> Vec<BatchEvent> {
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(10), batch.next_event())
            .await
            .expect("batch did not drain in time")
        {
            events.push(event);
        }
        events
    }

    fn finished(events: &[BatchEvent]) -> usize {
        events
            .iter()
            .filter_map(BatchEvent::as_worker)
            .filter(|e| e.is_finished())
            .count()
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let config = EngineConfig::default()
            .with_rate_limit(RateLimitConfig::default().with_threshold(0));
        assert!(matches!(
            Batch::new(config),
            Err(EngineError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[tokio::test]
    async fn test_empty_batch_ends_immediately() {
        let mut batch = Batch::new(EngineConfig::default()).unwrap();
        assert!(batch.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_parallel_batch_runs_to_completion() {
        let mut batch = Batch::new(EngineConfig::default()).unwrap();
        let workers: Vec<_> = (0..3)
            .map(|i| {
                batch.worker_fn(format!("acct-{i}"), |ctx| async move {
                    ctx.progress(100, "done");
                    Ok(())
                })
            })
            .collect();
        assert_eq!(batch.launch_parallel(workers).len(), 3);

        let events = collect(&mut batch).await;
        assert_eq!(finished(&events), 3);
        assert_eq!(batch.engine().completed_count(), 3);
    }

    #[tokio::test]
    async fn test_staggered_batch_with_zero_delay() {
        let config = EngineConfig::default().with_launch_delay(DelayRange::none());
        let mut batch = Batch::new(config).unwrap();
        let workers: Vec<_> = (0..2)
            .map(|i| batch.worker_fn(format!("acct-{i}"), |_ctx| async move { Ok(()) }))
            .collect();
        batch.launch_staggered(workers);

        let events = collect(&mut batch).await;
        assert_eq!(finished(&events), 2);
        assert!(events.contains(&BatchEvent::Scheduler(SchedulerEvent::Delay { secs: 0 })));
    }

    #[tokio::test]
    async fn test_workers_share_policy() {
        let mut batch = Batch::new(EngineConfig::default()).unwrap();
        let workers: Vec<_> = (0..3)
            .map(|i| {
                batch.worker_fn(format!("acct-{i}"), |ctx| async move {
                    ctx.handle_failure(&JobError::remote("FLOOD_WAIT_3"));
                    Ok(())
                })
            })
            .collect();
        batch.launch_parallel(workers);
        collect(&mut batch).await;

        assert_eq!(batch.policy().consecutive_count(), 3);
        batch.reset_rate_limits();
        assert_eq!(batch.policy().consecutive_count(), 0);
    }
}

//! Execution engine: bookkeeping and bulk control over a set of workers
//!
//! The engine lives on the coordinating thread. Workers never touch its
//! sets; they report through the event channel and the engine moves them
//! from `active` to `completed` when it drains their `Finished` event.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::worker::{Worker, WorkerEvent, WorkerEventKind, WorkerHandle, WorkerId, WorkerState};

/// Snapshot of one worker for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: WorkerId,
    pub identity: String,
    pub state: WorkerState,
}

impl WorkerSummary {
    fn of(worker: &Worker) -> Self {
        Self {
            worker_id: worker.id(),
            identity: worker.identity().to_string(),
            state: worker.state(),
        }
    }
}

/// Owns workers and tracks which are running and which are done
///
/// A worker is in at most one of `registered` (added, not started),
/// `active` and `completed` at any time.
pub struct ExecutionEngine {
    registered: BTreeMap<WorkerId, Worker>,
    active: BTreeMap<WorkerId, Worker>,
    completed: BTreeMap<WorkerId, Worker>,
    tx: mpsc::UnboundedSender<WorkerEvent>,
    rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionEngine {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            registered: BTreeMap::new(),
            active: BTreeMap::new(),
            completed: BTreeMap::new(),
            tx,
            rx,
        }
    }

    /// Register a worker without starting it
    pub fn add(&mut self, worker: Worker) -> WorkerId {
        let id = worker.id();
        if self.contains(id) {
            return id;
        }
        debug!(worker_id = %id, identity = %worker.identity(), "Worker registered");
        self.registered.insert(id, worker);
        id
    }

    /// Register (if needed) and start a worker
    ///
    /// A worker whose thread could not be created is dropped and the launch
    /// error returned.
    pub fn start(&mut self, worker: Worker) -> Result<WorkerId, EngineError> {
        let id = self.add(worker);
        self.start_registered(id)
    }

    /// Start a worker previously passed to [`add`](Self::add)
    pub fn start_registered(&mut self, id: WorkerId) -> Result<WorkerId, EngineError> {
        let Some(mut worker) = self.registered.remove(&id) else {
            if let Some(worker) = self.active.get(&id).or_else(|| self.completed.get(&id)) {
                return Err(EngineError::AlreadyStarted {
                    identity: worker.identity().to_string(),
                });
            }
            return Err(EngineError::UnknownWorker(id));
        };

        match worker.start(self.tx.clone()) {
            Ok(()) => {
                self.active.insert(id, worker);
                Ok(id)
            }
            Err(e) => {
                error!(worker_id = %id, identity = %worker.identity(), error = %e, "Failed to start worker");
                Err(e)
            }
        }
    }

    /// Request a stop for one active worker
    ///
    /// Finished and not-yet-started workers are left alone.
    pub fn stop(&mut self, id: WorkerId) -> Result<(), EngineError> {
        if let Some(worker) = self.active.get(&id) {
            worker.stop();
            Ok(())
        } else if self.contains(id) {
            Ok(())
        } else {
            Err(EngineError::UnknownWorker(id))
        }
    }

    /// Request a stop for every active worker; does not wait for them
    ///
    /// Idempotent. Returns the number of workers asked to stop.
    pub fn stop_all(&mut self) -> usize {
        if self.active.is_empty() {
            return 0;
        }
        for worker in self.active.values() {
            worker.stop();
        }
        info!(count = self.active.len(), "Stop requested for all active workers");
        self.active.len()
    }

    /// Drop every completed worker from bookkeeping
    pub fn clear_completed(&mut self) -> usize {
        let count = self.completed.len();
        self.completed.clear();
        count
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Active plus completed; registered-but-unstarted workers are not counted
    pub fn total_count(&self) -> usize {
        self.active.len() + self.completed.len()
    }

    /// True iff nothing is active
    ///
    /// Also true before any worker has started; track batch start separately.
    pub fn is_all_finished(&self) -> bool {
        self.active.is_empty()
    }

    pub fn is_active(&self, id: WorkerId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn is_completed(&self, id: WorkerId) -> bool {
        self.completed.contains_key(&id)
    }

    /// Summaries of active workers, oldest first
    pub fn active(&self) -> Vec<WorkerSummary> {
        self.active.values().map(WorkerSummary::of).collect()
    }

    /// Summaries of completed workers, oldest first
    pub fn completed(&self) -> Vec<WorkerSummary> {
        self.completed.values().map(WorkerSummary::of).collect()
    }

    /// Handle to any worker the engine knows about
    pub fn handle(&self, id: WorkerId) -> Option<WorkerHandle> {
        self.registered
            .get(&id)
            .or_else(|| self.active.get(&id))
            .or_else(|| self.completed.get(&id))
            .map(Worker::handle)
    }

    /// Dispatch the next queued event without waiting
    pub fn try_next_event(&mut self) -> Option<WorkerEvent> {
        let event = self.rx.try_recv().ok()?;
        Some(self.dispatch(event))
    }

    /// Wait for and dispatch the next event
    ///
    /// Returns `None` once nothing is active and the queue is drained.
    /// Cancel-safe.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        if let Some(event) = self.try_next_event() {
            return Some(event);
        }
        if self.active.is_empty() {
            return None;
        }
        let event = self.rx.recv().await?;
        Some(self.dispatch(event))
    }

    fn contains(&self, id: WorkerId) -> bool {
        self.registered.contains_key(&id)
            || self.active.contains_key(&id)
            || self.completed.contains_key(&id)
    }

    fn dispatch(&mut self, event: WorkerEvent) -> WorkerEvent {
        match &event.kind {
            WorkerEventKind::Finished => match self.active.remove(&event.worker_id) {
                Some(mut worker) => {
                    worker.detach();
                    debug!(
                        worker_id = %event.worker_id,
                        identity = %event.identity,
                        active = self.active.len(),
                        "Worker finished"
                    );
                    self.completed.insert(event.worker_id, worker);
                }
                None => warn!(worker_id = %event.worker_id, "Finished event for untracked worker"),
            },
            WorkerEventKind::Error { message } => {
                warn!(worker_id = %event.worker_id, identity = %event.identity, error = %message, "Worker error");
            }
            WorkerEventKind::Emergency { reason } => {
                error!(worker_id = %event.worker_id, identity = %event.identity, %reason, "Rate-limit emergency");
            }
            _ => {}
        }
        event
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("registered", &self.registered.len())
            .field("active", &self.active.len())
            .field("completed", &self.completed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DelayRange;
    use crate::error::JobError;
    use std::time::Duration;

    async fn drain_until_idle(engine: &mut ExecutionEngine) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), engine.next_event())
            .await
            .expect("engine did not go idle in time")
        {
            events.push(event);
        }
        events
    }

    fn quick(identity: &str) -> Worker {
        Worker::from_fn(identity, |ctx| async move {
            ctx.log("hello");
            Ok(())
        })
    }

    fn forever(identity: &str) -> Worker {
        Worker::from_fn(identity, |ctx| async move {
            loop {
                ctx.apply_delay().await?;
            }
        })
        .with_delay(DelayRange::fixed(600))
    }

    #[test]
    fn test_empty_engine() {
        let mut engine = ExecutionEngine::new();
        assert!(engine.is_all_finished());
        assert_eq!(engine.total_count(), 0);
        assert_eq!(engine.stop_all(), 0);
        assert_eq!(engine.stop_all(), 0);
        assert!(engine.try_next_event().is_none());
    }

    #[test]
    fn test_add_registers_without_starting() {
        let mut engine = ExecutionEngine::new();
        let id = engine.add(quick("acct-1"));
        assert_eq!(engine.active_count(), 0);
        assert_eq!(engine.total_count(), 0);
        assert_eq!(engine.handle(id).unwrap().state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_finished_moves_worker_to_completed() {
        let mut engine = ExecutionEngine::new();
        let a = engine.start(quick("acct-a")).unwrap();
        let b = engine.start(quick("acct-b")).unwrap();
        assert_eq!(engine.active_count(), 2);

        let events = drain_until_idle(&mut engine).await;
        let finished: Vec<_> = events.iter().filter(|e| e.is_finished()).collect();
        assert_eq!(finished.len(), 2);

        assert!(engine.is_all_finished());
        assert_eq!(engine.completed_count(), 2);
        assert!(engine.is_completed(a) && !engine.is_active(a));
        assert!(engine.is_completed(b) && !engine.is_active(b));
        assert!(engine
            .completed()
            .iter()
            .all(|s| s.state == WorkerState::Finished));

        assert_eq!(engine.clear_completed(), 2);
        assert_eq!(engine.total_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_in_at_most_one_set() {
        let mut engine = ExecutionEngine::new();
        let ids: Vec<_> = (0..4)
            .map(|i| engine.start(quick(&format!("acct-{i}"))).unwrap())
            .collect();

        while let Some(_event) = engine.next_event().await {
            for id in &ids {
                assert!(!(engine.is_active(*id) && engine.is_completed(*id)));
            }
        }
        assert_eq!(engine.completed_count(), 4);
    }

    #[tokio::test]
    async fn test_stop_all_is_idempotent() {
        let mut engine = ExecutionEngine::new();
        engine.start(forever("acct-1")).unwrap();
        engine.start(forever("acct-2")).unwrap();

        assert_eq!(engine.stop_all(), 2);
        assert_eq!(engine.stop_all(), 2);

        let events = drain_until_idle(&mut engine).await;
        assert_eq!(events.iter().filter(|e| e.is_finished()).count(), 2);
        assert!(!events
            .iter()
            .any(|e| matches!(e.kind, WorkerEventKind::Error { .. })));

        assert_eq!(engine.stop_all(), 0);
        assert!(engine.try_next_event().is_none());
    }

    #[tokio::test]
    async fn test_error_reported_before_finished() {
        let mut engine = ExecutionEngine::new();
        engine
            .start(Worker::from_fn("acct-bad", |_ctx| async move {
                Err(JobError::transport("connection reset"))
            }))
            .unwrap();

        let events = drain_until_idle(&mut engine).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].kind, WorkerEventKind::Error { .. }));
        assert!(events[1].is_finished());
    }

    #[tokio::test]
    async fn test_stop_single_worker() {
        let mut engine = ExecutionEngine::new();
        let id = engine.start(forever("acct-1")).unwrap();
        engine.stop(id).unwrap();
        drain_until_idle(&mut engine).await;
        assert!(engine.stop(id).is_ok());
        assert!(matches!(
            engine.stop(WorkerId::new()),
            Err(EngineError::UnknownWorker(_))
        ));
    }

    #[tokio::test]
    async fn test_start_registered_twice() {
        let mut engine = ExecutionEngine::new();
        let id = engine.add(quick("acct-1"));
        engine.start_registered(id).unwrap();
        assert!(matches!(
            engine.start_registered(id),
            Err(EngineError::AlreadyStarted { .. })
        ));
        drain_until_idle(&mut engine).await;
    }
}

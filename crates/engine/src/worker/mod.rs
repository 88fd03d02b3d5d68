//! Workers: one job body, one OS thread, one private runtime
//!
//! This module provides:
//! - [`Worker`] - Owns a job body and runs it on a dedicated thread
//! - [`WorkerHandle`] - Clonable, `Send` view used to observe and stop a worker
//! - [`WorkerContext`] - What the job body sees while it runs
//! - [`Job`] - The job body contract
//!
//! # Architecture
//!
//! ```text
//!  coordinating thread                 worker thread (one per worker)
//! ┌────────────────────┐   start    ┌──────────────────────────────────┐
//! │  ExecutionEngine   │ ─────────► │ current-thread tokio runtime     │
//! │                    │            │   select! {                      │
//! │                    │            │     job.run(ctx).catch_unwind()  │
//! │                    │   stop     │     cancel.cancelled()           │
//! │                    │ ─────────► │   }                              │
//! │                    │            │ drop(job, runtime)               │
//! │                    │ ◄───────── │ Error? then Finished             │
//! └────────────────────┘  channel   └──────────────────────────────────┘
//! ```

mod context;
mod event;
mod job;
mod state;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::DelayRange;
use crate::delay::DelayGenerator;
use crate::error::{EngineError, JobError};
use crate::reliability::RateLimitPolicy;
use event::EventSink;

pub use context::WorkerContext;
pub use event::{WorkerEvent, WorkerEventKind, WorkerId};
pub use job::{FnJob, Job};
use state::StateCell;
pub use state::WorkerState;

/// Clonable view of a worker, usable from any thread
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    worker_id: WorkerId,
    identity: Arc<str>,
    state: Arc<StateCell>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    /// The worker's id
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// The worker's identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Whether a stop was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request a cooperative stop
    ///
    /// Sets the cancel flag and interrupts the job body at its next
    /// suspension point. Idempotent; a no-op once the worker has finished.
    pub fn stop(&self) {
        if self.state.transition(WorkerState::Stopping).is_ok() {
            debug!(worker_id = %self.worker_id, identity = %self.identity, "Stop requested");
            self.cancel.cancel();
        }
    }
}

/// The unit of concurrent work
///
/// # Example
///
/// ```ignore
/// use fleetrun_engine::prelude::*;
///
/// let worker = Worker::from_fn("session-7", |ctx| async move {
///     ctx.log("connected");
///     ctx.apply_delay().await?;
///     Ok(())
/// })
/// .with_delay(DelayRange::new(2, 5)?);
///
/// let mut engine = ExecutionEngine::new();
/// engine.start(worker)?;
/// ```
pub struct Worker {
    handle: WorkerHandle,
    job: Option<Box<dyn Job>>,
    delay: DelayRange,
    policy: Option<Arc<RateLimitPolicy>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create a worker running `job` for `identity`
    pub fn new(identity: impl Into<String>, job: impl Job) -> Self {
        let identity: Arc<str> = Arc::from(identity.into());
        Self {
            handle: WorkerHandle {
                worker_id: WorkerId::new(),
                identity,
                state: Arc::new(StateCell::new()),
                cancel: CancellationToken::new(),
            },
            job: Some(Box::new(job)),
            delay: DelayRange::none(),
            policy: None,
            thread: None,
        }
    }

    /// Create a worker from a one-shot async closure
    pub fn from_fn<F, Fut>(identity: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(WorkerContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + 'static,
    {
        Self::new(identity, FnJob::new(f))
    }

    /// Set the pacing range used by [`WorkerContext::apply_delay`]
    pub fn with_delay(mut self, range: DelayRange) -> Self {
        self.delay = range;
        self
    }

    /// Share a rate-limit policy with this worker
    pub fn with_policy(mut self, policy: Arc<RateLimitPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// The worker's id
    pub fn id(&self) -> WorkerId {
        self.handle.worker_id
    }

    /// The worker's identity
    pub fn identity(&self) -> &str {
        &self.handle.identity
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    /// The pacing range
    pub fn delay(&self) -> DelayRange {
        self.delay
    }

    /// A clonable handle to this worker
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Request a cooperative stop; see [`WorkerHandle::stop`]
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Spawn the worker's thread and enter the job body
    ///
    /// The runtime is built before the thread is spawned so that both
    /// failure modes are reported here rather than lost on the new thread.
    pub(crate) fn start(
        &mut self,
        tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<(), EngineError> {
        let identity = self.handle.identity.to_string();

        if self.handle.state.transition(WorkerState::Running).is_err() {
            return Err(EngineError::AlreadyStarted { identity });
        }
        let Some(job) = self.job.take() else {
            return Err(EngineError::AlreadyStarted { identity });
        };

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(source) => {
                self.job = Some(job);
                self.handle.state.rollback_to_idle();
                return Err(EngineError::WorkerLaunch { identity, source });
            }
        };

        let sink = EventSink::new(self.handle.worker_id, self.handle.identity.clone(), tx);
        let ctx = WorkerContext::new(
            self.handle.worker_id,
            self.handle.identity.clone(),
            self.handle.cancel.clone(),
            DelayGenerator::from_range(self.delay),
            self.policy.clone(),
            sink.clone(),
        );
        let state = self.handle.state.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("worker-{}", self.handle.identity.replace('\0', "")))
            .spawn(move || run_worker(runtime, job, ctx, state, sink));

        match spawned {
            Ok(thread) => {
                info!(
                    worker_id = %self.handle.worker_id,
                    identity = %self.handle.identity,
                    "Worker started"
                );
                self.thread = Some(thread);
                Ok(())
            }
            Err(source) => {
                self.handle.state.rollback_to_idle();
                Err(EngineError::WorkerLaunch { identity, source })
            }
        }
    }

    /// Let the thread run on its own; it ends right after `Finished`
    pub(crate) fn detach(&mut self) {
        self.thread.take();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.handle.worker_id)
            .field("identity", &self.handle.identity)
            .field("state", &self.state())
            .field("delay", &self.delay)
            .finish()
    }
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Worker thread body: run the job, release everything, report
fn run_worker(
    runtime: tokio::runtime::Runtime,
    mut job: Box<dyn Job>,
    ctx: WorkerContext,
    state: Arc<StateCell>,
    sink: EventSink,
) {
    let span = info_span!("worker", worker_id = %ctx.worker_id(), identity = %ctx.identity());
    let cancel = ctx.cancellation_token();

    let outcome = runtime.block_on(
        async {
            let body = AssertUnwindSafe(job.run(&ctx)).catch_unwind();
            tokio::select! {
                result = body => match result {
                    Ok(Ok(())) => Outcome::Completed,
                    Ok(Err(err)) if err.is_cancelled() => Outcome::Cancelled,
                    Ok(Err(err)) => Outcome::Failed(err.to_string()),
                    Err(panic) => Outcome::Failed(format!("job panicked: {}", panic_message(&*panic))),
                },
                _ = cancel.cancelled() => Outcome::Cancelled,
            }
        }
        .instrument(span.clone()),
    );

    // Owned resources go before anyone hears about the finish.
    drop(job);
    drop(ctx);
    drop(runtime);

    let _entered = span.enter();
    match outcome {
        Outcome::Completed => info!("Job completed"),
        Outcome::Cancelled => info!("Job cancelled"),
        Outcome::Failed(message) => {
            warn!(error = %message, "Job failed");
            sink.emit(WorkerEventKind::Error { message });
        }
    }

    let _ = state.transition(WorkerState::Finished);
    sink.emit(WorkerEventKind::Finished);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

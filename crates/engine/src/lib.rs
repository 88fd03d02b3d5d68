//! # Fleetrun Engine
//!
//! Task execution and backoff coordination for batches of independent,
//! long-running network jobs, one job per identity (session, bot token).
//!
//! ## Features
//!
//! - **Thread-per-worker execution**: every job body gets its own OS thread and a private single-threaded runtime
//! - **Cooperative cancellation**: stop requests interrupt pacing delays promptly
//! - **Staggered launch**: batches start one worker at a time with a random pause in between
//! - **Shared rate-limit policy**: flood-wait hits from all workers feed one escalation state machine
//! - **Typed event channel**: hosts drain worker and scheduler events on their own thread
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Host (UI, headless runner)                   │
//! │        (awaits Batch::next_event, renders, stops)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │             Batch: LaunchScheduler + ExecutionEngine         │
//! │  (coordinating thread, bookkeeping only, never blocks)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  start / stop       ▲ events
//!                              ▼                     │
//! ┌─────────────────────────────────────────────────────────────┐
//! │     Worker threads (current-thread runtime each)             │
//! │  (run job bodies, apply delays, report to RateLimitPolicy)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use fleetrun_engine::prelude::*;
//!
//! let config = EngineConfig::default()
//!     .with_launch_delay(DelayRange::new(2, 6)?)
//!     .with_action_delay(DelayRange::new(1, 3)?)
//!     .with_stop_on_emergency(true);
//! let mut batch = Batch::new(config)?;
//!
//! let workers = sessions
//!     .iter()
//!     .map(|session| {
//!         batch.worker_fn(session.clone(), |ctx| async move {
//!             for step in 0..10u8 {
//!                 if let Err(err) = do_step(ctx.identity()).await {
//!                     match ctx.handle_failure(&err) {
//!                         FailureAction::RetryAfter(wait) => ctx.sleep(wait).await?,
//!                         FailureAction::Abort => return Err(err),
//!                         FailureAction::Ignore => {}
//!                     }
//!                 }
//!                 ctx.progress((step + 1) * 10, "step done");
//!                 ctx.apply_delay().await?;
//!             }
//!             Ok(())
//!         })
//!     })
//!     .collect::<Vec<_>>();
//!
//! batch.launch_staggered(workers);
//! while let Some(event) = batch.next_event().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod config;
pub mod delay;
pub mod engine;
pub mod error;
pub mod reliability;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{DelayRange, EngineConfig, RateLimitConfig};
    pub use crate::delay::DelayGenerator;
    pub use crate::engine::{
        Batch, BatchEvent, ExecutionEngine, LaunchScheduler, SchedulerEvent, WorkerSummary,
    };
    pub use crate::error::{Cancelled, ConfigError, EngineError, JobError};
    pub use crate::reliability::{
        Classification, EmergencyReason, Escalation, FailureAction, RateLimitPolicy,
    };
    pub use crate::worker::{
        Job, Worker, WorkerContext, WorkerEvent, WorkerEventKind, WorkerHandle, WorkerId,
        WorkerState,
    };
    pub use async_trait::async_trait;
}

// Re-export key types at crate root
pub use config::{DelayRange, EngineConfig, RateLimitConfig};
pub use delay::DelayGenerator;
pub use engine::{Batch, BatchEvent, ExecutionEngine, LaunchScheduler, SchedulerEvent, WorkerSummary};
pub use error::{Cancelled, ConfigError, EngineError, JobError};
pub use reliability::{Classification, EmergencyReason, Escalation, FailureAction, RateLimitPolicy};
pub use worker::{
    FnJob, Job, Worker, WorkerContext, WorkerEvent, WorkerEventKind, WorkerHandle, WorkerId,
    WorkerState,
};

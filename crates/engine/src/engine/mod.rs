//! Coordination: engine, launch scheduler and batch
//!
//! Everything here lives on the coordinating thread and never blocks it.
//!
//! ```text
//!                         Batch
//!  ┌──────────────────┐  start   ┌──────────────────┐  events  ┌─────────┐
//!  │ LaunchScheduler  │ ───────► │ ExecutionEngine  │ ◄─────── │ workers │
//!  │  pending queue   │          │  registered      │          └────┬────┘
//!  │  1s countdown    │ ◄─────── │  active          │               │
//!  └──────────────────┘ finished │  completed       │               │
//!                                └──────────────────┘               │
//!                   Arc<RateLimitPolicy> shared by every worker ────┘
//! ```

mod batch;
mod manager;
mod scheduler;

pub use batch::{Batch, BatchEvent};
pub use manager::{ExecutionEngine, WorkerSummary};
pub use scheduler::{LaunchScheduler, SchedulerEvent};

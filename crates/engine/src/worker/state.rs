//! Worker lifecycle state machine

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// State of a worker
///
/// ```text
/// Idle ──► Running ──► Stopping ──► Finished
///             └──────────────────────┘
/// ```
///
/// `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Created, not started
    Idle,
    /// Job body is executing
    Running,
    /// Stop requested, job body has not returned yet
    Stopping,
    /// Job body returned, failed or was cancelled
    Finished,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Idle, Running) | (Running, Stopping) | (Running, Finished) | (Stopping, Finished)
        )
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Check if the worker's thread is alive
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Stopping => 2,
            Self::Finished => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Finished,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

/// Lock-free cell shared between a worker's owner and its thread
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Idle.to_u8()))
    }

    pub(crate) fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `target` if the current state allows it
    ///
    /// Returns the state that was replaced on success.
    pub(crate) fn transition(&self, target: WorkerState) -> Result<WorkerState, WorkerState> {
        let mut current = self.get();
        loop {
            if !current.can_transition_to(target) {
                return Err(current);
            }
            match self.0.compare_exchange(
                current.to_u8(),
                target.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = WorkerState::from_u8(actual),
            }
        }
    }

    /// Undo a start whose thread never came up
    pub(crate) fn rollback_to_idle(&self) {
        let _ = self.0.compare_exchange(
            WorkerState::Running.to_u8(),
            WorkerState::Idle.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

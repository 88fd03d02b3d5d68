//! Error types for the engine
//!
//! Rate-limit hits are deliberately absent: they are classified conditions
//! (see [`crate::reliability::Classification`]) surfaced as events, never
//! as errors.

use crate::worker::WorkerId;

/// Engine-level errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The worker's thread or run-loop could not be created
    #[error("failed to launch worker {identity}: {source}")]
    WorkerLaunch {
        identity: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker has already left the idle state
    #[error("worker {identity} was already started")]
    AlreadyStarted { identity: String },

    /// No worker with this id is registered
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration errors, raised when a value is configured rather than when it is used
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `min` is greater than `max`
    #[error("invalid delay range: min {min} is greater than max {max}")]
    InvalidRange { min: u64, max: u64 },

    /// A value is out of its allowed domain
    #[error("invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// An interruptible wait was cut short by a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("worker was cancelled")]
pub struct Cancelled;

/// Failure raised by a job body
///
/// The message text is what the rate-limit classifier inspects, so variants
/// wrap the remote service's wording as-is.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The remote service rejected the request
    #[error("{0}")]
    Remote(String),

    /// Connection, TLS or proxy level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The job body gave up on its own
    #[error("aborted: {0}")]
    Aborted(String),

    /// The job body observed a stop request
    #[error("cancelled")]
    Cancelled,

    /// Anything else
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    /// Create a remote-service error from its message
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote(message.into())
    }

    /// Create a transport error from its message
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Whether this error only reports a stop request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<Cancelled> for JobError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

//! Randomized delay generation
//!
//! One generator per worker: it holds no state beyond its range, but its
//! waits are tied to a single cancellation token.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::DelayRange;
use crate::error::{Cancelled, ConfigError};

/// Callback receiving each drawn delay once its wait is over
pub type DelayObserver = Arc<dyn Fn(u64) + Send + Sync>;

/// Draws uniformly random waits from an inclusive `[min, max]` range
///
/// # Example
///
/// ```
/// use fleetrun_engine::DelayGenerator;
///
/// let generator = DelayGenerator::new(2, 5).unwrap();
/// let secs = generator.draw();
/// assert!((2..=5).contains(&secs));
/// ```
#[derive(Clone, Default)]
pub struct DelayGenerator {
    range: DelayRange,
    observer: Option<DelayObserver>,
}

impl DelayGenerator {
    /// Create a generator for `[min_secs, max_secs]`
    pub fn new(min_secs: u64, max_secs: u64) -> Result<Self, ConfigError> {
        Ok(Self::from_range(DelayRange::new(min_secs, max_secs)?))
    }

    /// Create a generator from an already validated range
    pub fn from_range(range: DelayRange) -> Self {
        Self {
            range,
            observer: None,
        }
    }

    /// Report every completed wait to `observer`
    pub fn with_observer(mut self, observer: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Replace the range
    pub fn configure(&mut self, min_secs: u64, max_secs: u64) -> Result<(), ConfigError> {
        self.range = DelayRange::new(min_secs, max_secs)?;
        Ok(())
    }

    /// The configured range
    pub fn range(&self) -> DelayRange {
        self.range
    }

    /// Draw a delay without waiting
    ///
    /// Returns `0` when either bound is `0`.
    pub fn draw(&self) -> u64 {
        if self.range.is_disabled() {
            return 0;
        }
        rand::thread_rng().gen_range(self.range.min_secs..=self.range.max_secs)
    }

    /// Draw a delay, wait it out, then report it
    ///
    /// Never suspends when the range is disabled. The wait ends early with
    /// [`Cancelled`] as soon as `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Result<u64, Cancelled> {
        let secs = self.draw();
        self.wait(secs, cancel).await?;
        Ok(secs)
    }

    /// Wait out an already drawn delay, then report it
    pub async fn wait(&self, secs: u64, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if secs > 0 {
            trace!(delay_secs = secs, "Waiting");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = cancel.cancelled() => return Err(Cancelled),
            }
        } else if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        if let Some(observer) = &self.observer {
            observer(secs);
        }
        Ok(())
    }
}

impl std::fmt::Debug for DelayGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayGenerator")
            .field("range", &self.range)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

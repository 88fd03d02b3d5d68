//! Job body definition

use std::future::Future;

use async_trait::async_trait;

use super::WorkerContext;
use crate::error::JobError;

/// The unit of work a [`Worker`](super::Worker) executes
///
/// A job is moved onto the worker's own thread and polled by that thread's
/// single-threaded runtime, so it must be `Send` but its future need not be.
/// Returning `Ok(())` covers both success and an observed stop request;
/// returning `Err` produces the worker's single `error` event.
///
/// # Example
///
/// ```ignore
/// use fleetrun_engine::prelude::*;
///
/// struct Broadcast {
///     recipients: Vec<String>,
/// }
///
/// #[async_trait(?Send)]
/// impl Job for Broadcast {
///     async fn run(&mut self, ctx: &WorkerContext) -> Result<(), JobError> {
///         let total = self.recipients.len();
///         for (i, recipient) in self.recipients.iter().enumerate() {
///             if ctx.is_cancelled() {
///                 return Ok(());
///             }
///             send_to(recipient).await?;
///             ctx.progress(((i + 1) * 100 / total) as u8, recipient.clone());
///             ctx.apply_delay().await?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait(?Send)]
pub trait Job: Send + 'static {
    /// Execute the job body to completion or cancellation
    async fn run(&mut self, ctx: &WorkerContext) -> Result<(), JobError>;
}

/// Adapter turning a one-shot closure into a [`Job`]
pub struct FnJob<F>(Option<F>);

impl<F> FnJob<F> {
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self(Some(f))
    }
}

#[async_trait(?Send)]
impl<F, Fut> Job for FnJob<F>
where
    F: FnOnce(WorkerContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), JobError>> + 'static,
{
    async fn run(&mut self, ctx: &WorkerContext) -> Result<(), JobError> {
        match self.0.take() {
            Some(f) => f(ctx.clone()).await,
            None => Ok(()),
        }
    }
}

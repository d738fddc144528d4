//! Bounded admission for image tasks.
//!
//! A [`ConcurrencyLimiter`] is a counting gate of width *K*: at most K
//! admitted futures run at once and the next queued one is admitted as soon
//! as a slot frees. Admission is FIFO because permits are taken by the
//! submitting caller, in submission order, from tokio's fair semaphore.
//! Completion order is unconstrained.
//!
//! Each batch gets its own limiter. Permits are owned by the spawned task
//! and released when it ends (including by panic), so running several waves
//! through one limiter never leaks slots from one wave into the next.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    permits: Arc<Semaphore>,
    width: usize,
}

impl ConcurrencyLimiter {
    /// A limiter admitting `width` concurrent tasks (at least one).
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            permits: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `fut` on the current task once a slot is free.
    pub async fn run<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        // The semaphore is never closed, so acquisition cannot fail; if it
        // somehow did, running unthrottled beats dropping the work.
        let _permit = self.permits.acquire().await.ok();
        fut.await
    }

    /// Wait for a free slot, then spawn `fut` holding it.
    ///
    /// Returns once the task is admitted, not once it finishes.
    pub async fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok();
        tokio::spawn(async move {
            let _permit = permit;
            fut.await
        })
    }

    /// Admit every future in order and wait for all of them.
    ///
    /// Results come back in submission order; a panicking future surfaces as
    /// its `JoinError` without disturbing the others.
    pub async fn run_all<I, F>(&self, futures: I) -> Vec<Result<F::Output, JoinError>>
    where
        I: IntoIterator<Item = F>,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut handles = Vec::new();
        for fut in futures {
            handles.push(self.spawn(fut).await);
        }
        join_all(handles).await
    }
}

// Single-assignment promise over a cluster Result
//
// A promise is either unresolved or resolved; the first resolution wins and
// later attempts are no-ops. Waiters are native async tasks; the combinators
// are thin wrappers over the futures joiners rather than callback chains.

use crate::error::{ClusterError, Result};
use crate::runtime::scheduler::Scheduler;
use futures::future::{select_all, try_join_all};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::Notify;

/// Single-assignment future over `Result<T>`.
///
/// Cloning shares the underlying cell; any clone may resolve it and every
/// clone observes the same outcome.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    cell: OnceLock<Result<T>>,
    notify: Notify,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    /// Create an unresolved promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cell: OnceLock::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Resolve with the given result. Returns true on the first successful
    /// attempt; all later attempts leave the promise untouched.
    pub fn resolve(&self, result: Result<T>) -> bool {
        let first = self.inner.cell.set(result).is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// Resolve successfully.
    pub fn succeed(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Resolve with a failure cause.
    pub fn fail(&self, cause: ClusterError) -> bool {
        self.resolve(Err(cause))
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.cell.get().is_some()
    }

    /// Non-blocking peek at the outcome.
    pub fn peek(&self) -> Option<&Result<T>> {
        self.inner.cell.get()
    }
}

impl<T: Clone> Promise<T> {
    /// Wait for resolution and clone out the result.
    pub async fn value(&self) -> Result<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // The permit must be enabled before the final state check, or a
            // resolution racing between check and await would be missed.
            notified.as_mut().enable();
            if let Some(result) = self.inner.cell.get() {
                return result.clone();
            }
            notified.await;
        }
    }

    /// Wait up to `timeout`; expiry yields a timeout cause and leaves the
    /// promise itself untouched.
    pub async fn await_timeout(&self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self.value()).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout(format!(
                "promise unresolved after {} ms",
                timeout.as_millis()
            ))),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Run a future on the shared executor and resolve the returned promise
    /// with its output.
    pub fn spawn<F>(fut: F) -> Promise<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let promise = Promise::new();
        let out = promise.clone();
        tokio::spawn(async move {
            let result = fut.await;
            out.resolve(result);
        });
        promise
    }

    /// Run a future after `delay`. The timer checks promise state before
    /// firing; a promise resolved in the meantime suppresses the work.
    pub fn defer<F>(scheduler: &Scheduler, delay: Duration, fut: F) -> Promise<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let promise = Promise::new();
        let out = promise.clone();
        scheduler.schedule_once(delay, async move {
            if !out.is_resolved() {
                out.resolve(fut.await);
            }
        });
        promise
    }

    /// Succeeds with every value once all inputs succeed; fails on the first
    /// input failure.
    pub fn all(promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
        Promise::spawn(async move {
            try_join_all(promises.iter().map(|p| p.value())).await
        })
    }

    /// Resolves with the first input to resolve, success or failure.
    pub fn any(promises: Vec<Promise<T>>) -> Promise<T> {
        Promise::spawn(async move {
            if promises.is_empty() {
                return Err(ClusterError::InvalidState(
                    "any() requires at least one promise".to_string(),
                ));
            }
            let futures: Vec<_> = promises
                .iter()
                .map(|p| Box::pin(p.value()))
                .collect();
            let (result, _, _) = select_all(futures).await;
            result
        })
    }

    /// Resolves with the first input success; when every input fails, fails
    /// with `fallback`.
    pub fn any_success(promises: Vec<Promise<T>>, fallback: ClusterError) -> Promise<T> {
        Promise::spawn(async move {
            let mut pending: FuturesUnordered<_> =
                promises.iter().map(|p| p.value()).collect();
            while let Some(result) = pending.next().await {
                if result.is_ok() {
                    return result;
                }
            }
            Err(fallback)
        })
    }
}

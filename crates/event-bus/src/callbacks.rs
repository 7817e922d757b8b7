//! # Observer Lists
//!
//! Reconnect, health and backlog notifications fan out to registered
//! callbacks in registration order. Every invocation is isolated: an error,
//! a panic or an overrun of the per-callback timeout is logged and counted,
//! and the remaining callbacks still run.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::warn;

/// Future returned by a callback.
pub type CallbackFuture = BoxFuture<'static, anyhow::Result<()>>;

type Callback<T> = Arc<dyn Fn(T) -> CallbackFuture + Send + Sync>;

/// Default bound on a single callback invocation.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Ordered list of callbacks receiving values of type `T`.
pub struct CallbackList<T> {
    name: &'static str,
    timeout: Duration,
    callbacks: RwLock<Vec<Callback<T>>>,
}

impl<T: Clone + Send + 'static> CallbackList<T> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self::with_timeout(name, DEFAULT_CALLBACK_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Append a callback.
    pub fn register<F, Fut>(&self, callback: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: Callback<T> = Arc::new(move |value| callback(value).boxed());
        self.callbacks.write().push(callback);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }

    /// Invoke every callback in registration order. Returns the number that failed.
    pub async fn notify(&self, value: T) -> usize {
        let callbacks: Vec<Callback<T>> = self.callbacks.read().clone();
        let mut failures = 0;

        for (index, callback) in callbacks.iter().enumerate() {
            let invocation = AssertUnwindSafe(callback(value.clone())).catch_unwind();
            match tokio::time::timeout(self.timeout, invocation).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    failures += 1;
                    warn!(callbacks = self.name, index, error = %e, "Callback returned error");
                }
                Ok(Err(_)) => {
                    failures += 1;
                    warn!(callbacks = self.name, index, "Callback panicked");
                }
                Err(_) => {
                    failures += 1;
                    warn!(callbacks = self.name, index, timeout = ?self.timeout, "Callback timed out");
                }
            }
        }

        failures
    }
}

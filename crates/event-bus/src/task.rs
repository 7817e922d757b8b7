//! Stoppable periodic loops.
//!
//! Health checkers and backlog detectors each own one [`BackgroundTask`].
//! Stopping flips a `watch` flag and waits for the task to exit, so no
//! timer outlives its owner.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Handle to a spawned loop.
pub(crate) struct BackgroundTask {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `body` with a stop receiver that flips to `true` on [`stop`](Self::stop).
    pub(crate) fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(body(stop_rx));
        debug!(task = name, "Background task started");
        Self {
            name,
            stop_tx,
            handle,
        }
    }

    /// Signal the loop and wait until it has exited.
    pub(crate) async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(task = self.name, error = %e, "Background task ended abnormally");
        }
        debug!(task = self.name, "Background task stopped");
    }
}

/// Slot holding at most one running [`BackgroundTask`].
#[derive(Default)]
pub(crate) struct TaskSlot {
    task: Mutex<Option<BackgroundTask>>,
}

impl TaskSlot {
    pub(crate) fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Store `task` unless one is already running; returns `false` in that case.
    pub(crate) fn start_with<F>(&self, spawn: F) -> bool
    where
        F: FnOnce() -> BackgroundTask,
    {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(spawn());
        true
    }

    /// Stop the running task, if any. Returns whether one was running.
    pub(crate) async fn stop(&self) -> bool {
        let task = self.task.lock().take();
        match task {
            Some(task) => {
                task.stop().await;
                true
            }
            None => false,
        }
    }
}

/// Interval whose first tick fires immediately and which does not burst
/// after a slow iteration.
pub(crate) fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

//! # Keyed-Worker Pool
//!
//! Per-aggregate ordering without locks between workers.
//!
//! ```text
//!                       ┌──────────────┐   bounded FIFO   ┌──────────┐
//!  submit("order-42") ─►│ fnv1a(id) % N├──────────────────►│ worker 3 │─► handler
//!                       └──────────────┘                   └──────────┘
//!  submit("user-7")   ─►      ...       ──────────────────► worker 0 ...
//! ```
//!
//! - The same aggregate id always maps to the same worker for the lifetime
//!   of the pool; the routing function is pure and shared by all pools.
//! - Each worker is one task running its jobs one at a time in arrival order.
//! - A full queue blocks the submitter (backpressure). With an
//!   `enqueue_timeout` configured it fails with `PoolError::QueueFull` instead.
//! - A failing job is reported through its completion and the worker moves on.
//! - `close()` stops intake, drains every queue and waits for the workers.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bus_types::PoolError;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Resolves to the handler's result once the worker has run the job.
pub type Completion = BoxFuture<'static, anyhow::Result<()>>;

/// Unit of work handed to a worker.
pub type Job = BoxFuture<'static, anyhow::Result<()>>;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Worker index for an aggregate id in a pool of `worker_count` workers.
#[must_use]
pub fn worker_index(aggregate_id: &str, worker_count: usize) -> usize {
    if worker_count == 0 {
        return 0;
    }
    fnv1a_32(aggregate_id.as_bytes()) as usize % worker_count
}

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedWorkerPoolConfig {
    pub worker_count: usize,
    /// Capacity of each worker's queue.
    pub queue_size: usize,
    /// `None` blocks until space frees up.
    #[serde(with = "bus_types::serde_ms::option", default)]
    pub enqueue_timeout: Option<Duration>,
}

impl Default for KeyedWorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 256,
            queue_size: 1000,
            enqueue_timeout: None,
        }
    }
}

struct Task {
    job: Job,
    done: oneshot::Sender<anyhow::Result<()>>,
}

#[derive(Default)]
struct WorkerCounters {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Per-worker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStats {
    pub processed: u64,
    pub failed: u64,
    pub queued: usize,
}

/// Fixed set of single-task workers with aggregate affinity.
pub struct KeyedWorkerPool {
    config: KeyedWorkerPoolConfig,
    senders: RwLock<Option<Vec<mpsc::Sender<Task>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Vec<WorkerCounters>>,
}

impl KeyedWorkerPool {
    /// Spawn the workers. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(config: KeyedWorkerPoolConfig) -> Self {
        let worker_count = config.worker_count.max(1);
        let queue_size = config.queue_size.max(1);
        let counters: Arc<Vec<WorkerCounters>> =
            Arc::new((0..worker_count).map(|_| WorkerCounters::default()).collect());

        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel(queue_size);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(index, rx, counters.clone())));
        }

        debug!(workers = worker_count, queue_size, "Keyed worker pool started");

        Self {
            config: KeyedWorkerPoolConfig {
                worker_count,
                queue_size,
                ..config
            },
            senders: RwLock::new(Some(senders)),
            handles: Mutex::new(handles),
            counters,
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    /// Worker that owns `aggregate_id`.
    #[must_use]
    pub fn route(&self, aggregate_id: &str) -> usize {
        worker_index(aggregate_id, self.config.worker_count)
    }

    /// Queue `job` on the worker owning `aggregate_id`.
    ///
    /// Returns once the job is queued; the returned [`Completion`] resolves
    /// with the job's result after the worker ran it. Cancelling the caller
    /// after this returns does not remove the job from the queue.
    pub async fn submit(&self, aggregate_id: &str, job: Job) -> Result<Completion, PoolError> {
        if aggregate_id.trim().is_empty() {
            return Err(PoolError::MissingAggregateId);
        }

        let worker = self.route(aggregate_id);
        let sender = {
            let guard = self.senders.read();
            let senders = guard.as_ref().ok_or(PoolError::Closed)?;
            senders[worker].clone()
        };

        let (done_tx, done_rx) = oneshot::channel();
        let task = Task { job, done: done_tx };

        match self.config.enqueue_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, sender.send(task)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => {
                    warn!(worker, aggregate_id, ?timeout, "Worker queue full");
                    return Err(PoolError::QueueFull { worker, timeout });
                }
            },
            None => sender.send(task).await.map_err(|_| PoolError::Closed)?,
        }

        Ok(async move {
            match done_rx.await {
                Ok(result) => result,
                Err(_) => Err(PoolError::WorkerGone(worker).into()),
            }
        }
        .boxed())
    }

    /// Queue `job` and wait for its result.
    pub async fn process(&self, aggregate_id: &str, job: Job) -> anyhow::Result<()> {
        let completion = self.submit(aggregate_id, job).await?;
        completion.await
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.senders.read().is_none()
    }

    /// Snapshot of every worker's counters.
    #[must_use]
    pub fn stats(&self) -> Vec<WorkerStats> {
        let guard = self.senders.read();
        self.counters
            .iter()
            .enumerate()
            .map(|(index, counters)| WorkerStats {
                processed: counters.processed.load(Ordering::Relaxed),
                failed: counters.failed.load(Ordering::Relaxed),
                queued: guard
                    .as_ref()
                    .map(|s| s[index].max_capacity() - s[index].capacity())
                    .unwrap_or(0),
            })
            .collect()
    }

    /// Messages waiting in all queues.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.stats().iter().map(|s| s.queued).sum()
    }

    /// Stop intake, run every queued job, then wait for the workers to exit.
    /// Idempotent.
    pub async fn close(&self) {
        let senders = self.senders.write().take();
        if senders.is_none() {
            return;
        }
        drop(senders);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        debug!(workers = self.config.worker_count, "Keyed worker pool drained");
    }
}

async fn run_worker(
    index: usize,
    mut rx: mpsc::Receiver<Task>,
    counters: Arc<Vec<WorkerCounters>>,
) {
    while let Some(Task { job, done }) = rx.recv().await {
        let result = match AssertUnwindSafe(job).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("handler panicked on worker {index}")),
        };

        counters[index].processed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = &result {
            counters[index].failed.fetch_add(1, Ordering::Relaxed);
            debug!(worker = index, error = %e, "Job failed");
        }
        // Submitter may have stopped waiting.
        let _ = done.send(result);
    }
    debug!(worker = index, "Worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(workers: usize, queue: usize) -> KeyedWorkerPoolConfig {
        KeyedWorkerPoolConfig {
            worker_count: workers,
            queue_size: queue,
            enqueue_timeout: None,
        }
    }

    #[test]
    fn test_fnv1a_reference_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[tokio::test]
    async fn test_routing_is_stable_across_pools() {
        let a = KeyedWorkerPool::new(config(8, 4));
        let b = KeyedWorkerPool::new(config(8, 4));
        for id in ["order-42", "user-1", "x"] {
            assert_eq!(a.route(id), a.route(id));
            assert_eq!(a.route(id), b.route(id));
            assert_eq!(a.route(id), worker_index(id, 8));
        }
        a.close().await;
        b.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_aggregate_order_preserved() {
        let pool = KeyedWorkerPool::new(config(4, 16));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut completions = Vec::new();
        for version in 1..=200u32 {
            let seen = seen.clone();
            let job = async move {
                if version % 7 == 0 {
                    tokio::task::yield_now().await;
                }
                seen.lock().push(version);
                Ok(())
            }
            .boxed();
            completions.push(pool.submit("order-42", job).await.unwrap());
        }
        for c in completions {
            c.await.unwrap();
        }

        assert_eq!(*seen.lock(), (1..=200).collect::<Vec<_>>());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_failed_job_does_not_stop_worker() {
        let pool = KeyedWorkerPool::new(config(1, 8));
        let first = pool
            .submit("a", async { anyhow::bail!("poison") }.boxed())
            .await
            .unwrap();
        let second = pool.submit("a", async { Ok(()) }.boxed()).await.unwrap();

        assert!(first.await.is_err());
        assert!(second.await.is_ok());
        let stats = pool.stats();
        assert_eq!(stats[0].processed, 2);
        assert_eq!(stats[0].failed, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_panicking_job_is_reported() {
        let pool = KeyedWorkerPool::new(config(1, 8));
        let result = pool
            .process(
                "a",
                async {
                    if true {
                        panic!("handler bug");
                    }
                    Ok(())
                }
                .boxed(),
            )
            .await;
        assert!(result.is_err());
        assert!(pool.process("a", async { Ok(()) }.boxed()).await.is_ok());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_missing_aggregate_rejected() {
        let pool = KeyedWorkerPool::new(config(2, 2));
        let err = pool.submit(" ", async { Ok(()) }.boxed()).await.err();
        assert_eq!(err, Some(PoolError::MissingAggregateId));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_full_queue_times_out() {
        let pool = KeyedWorkerPool::new(KeyedWorkerPoolConfig {
            worker_count: 1,
            queue_size: 1,
            enqueue_timeout: Some(Duration::from_millis(30)),
        });
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // Occupies the worker.
        let blocker = pool
            .submit(
                "a",
                async move {
                    let _ = release_rx.await;
                    Ok(())
                }
                .boxed(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Fills the queue.
        let queued = pool.submit("a", async { Ok(()) }.boxed()).await.unwrap();

        let err = pool.submit("a", async { Ok(()) }.boxed()).await.err();
        assert!(matches!(err, Some(PoolError::QueueFull { worker: 0, .. })));

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
        queued.await.unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_drains_queued_jobs() {
        let pool = KeyedWorkerPool::new(config(2, 64));
        let count = Arc::new(AtomicU64::new(0));
        for i in 0..50 {
            let count = count.clone();
            let id = format!("agg-{}", i % 5);
            let _ = pool
                .submit(
                    &id,
                    async move {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        count.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    .boxed(),
                )
                .await
                .unwrap();
        }

        pool.close().await;
        assert_eq!(count.load(Ordering::Relaxed), 50);
        assert!(pool.is_closed());
        assert_eq!(
            pool.submit("a", async { Ok(()) }.boxed()).await.err(),
            Some(PoolError::Closed)
        );
        pool.close().await;
    }
}

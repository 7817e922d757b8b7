//! Publisher-side backlog detector.
//!
//! The facade feeds it with [`record_publish`](PublisherBacklogDetector::record_publish)
//! after every publish and callers may report their own outbound queue with
//! [`update_queue_depth`](PublisherBacklogDetector::update_queue_depth).
//! Each tick computes the rate and average latency since the previous tick,
//! then resets the counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bus_types::{BacklogSeverity, BusError, PublisherBacklogState};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::PublisherBacklogConfig;
use crate::callbacks::CallbackList;
use crate::task::{ticker, BackgroundTask, TaskSlot};

struct Shared {
    config: PublisherBacklogConfig,
    publish_count: AtomicU64,
    latency_nanos: AtomicU64,
    queue_depth: AtomicI64,
    last_check: Mutex<Instant>,
    last_reported: Mutex<(bool, BacklogSeverity)>,
    callbacks: CallbackList<PublisherBacklogState>,
}

/// Samples publish pressure and reports transitions.
pub struct PublisherBacklogDetector {
    shared: Arc<Shared>,
    task: TaskSlot,
}

impl PublisherBacklogDetector {
    #[must_use]
    pub fn new(config: PublisherBacklogConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                publish_count: AtomicU64::new(0),
                latency_nanos: AtomicU64::new(0),
                queue_depth: AtomicI64::new(0),
                last_check: Mutex::new(Instant::now()),
                last_reported: Mutex::new((false, BacklogSeverity::Normal)),
                callbacks: CallbackList::new("publisher_backlog"),
            }),
            task: TaskSlot::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PublisherBacklogConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn callbacks(&self) -> &CallbackList<PublisherBacklogState> {
        &self.shared.callbacks
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    pub fn record_publish(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.shared.publish_count.fetch_add(1, Ordering::Relaxed);
        self.shared.latency_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn update_queue_depth(&self, depth: i64) {
        self.shared.queue_depth.store(depth, Ordering::Relaxed);
    }

    /// Current sample without resetting the tick counters.
    #[must_use]
    pub fn state(&self) -> PublisherBacklogState {
        let elapsed = self.shared.last_check.lock().elapsed();
        let count = self.shared.publish_count.load(Ordering::Relaxed);
        let total = self.shared.latency_nanos.load(Ordering::Relaxed);
        sample(&self.shared, elapsed, count, total)
    }

    pub fn start(&self) -> Result<(), BusError> {
        let shared = self.shared.clone();
        let started = self.task.start_with(|| {
            *shared.last_check.lock() = Instant::now();
            BackgroundTask::spawn("publisher_backlog", move |stop| run(shared, stop))
        });
        if !started {
            return Err(BusError::AlreadyRunning("publisher backlog detector"));
        }
        info!(
            interval = ?self.shared.config.check_interval,
            max_queue_depth = self.shared.config.max_queue_depth,
            "Publisher backlog detector started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if self.task.stop().await {
            info!("Publisher backlog detector stopped");
        }
    }

    /// Run one tick outside the loop. Returns the sample when it was a
    /// transition and callbacks were invoked.
    pub async fn check_once(&self) -> Option<PublisherBacklogState> {
        check(&self.shared).await
    }
}

async fn run(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut interval = ticker(shared.config.check_interval);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        check(&shared).await;
    }
    debug!("Publisher backlog loop exited");
}

async fn check(shared: &Shared) -> Option<PublisherBacklogState> {
    let elapsed = {
        let mut last = shared.last_check.lock();
        let elapsed = last.elapsed();
        *last = Instant::now();
        elapsed
    };
    // Publishes recorded after the swap land in the next tick.
    let count = shared.publish_count.swap(0, Ordering::Relaxed);
    let total = shared.latency_nanos.swap(0, Ordering::Relaxed);
    let state = sample(shared, elapsed, count, total);

    {
        let mut last = shared.last_reported.lock();
        if *last == (state.has_backlog, state.severity) {
            return None;
        }
        *last = (state.has_backlog, state.severity);
    }

    if state.has_backlog {
        warn!(
            queue_depth = state.queue_depth,
            rate = state.publish_rate,
            avg_latency = ?state.avg_publish_latency,
            severity = ?state.severity,
            "Publisher backlog detected"
        );
    } else {
        info!(severity = ?state.severity, "Publisher backlog state changed");
    }
    shared.callbacks.notify(state.clone()).await;
    Some(state)
}

fn sample(shared: &Shared, elapsed: Duration, count: u64, total: u64) -> PublisherBacklogState {
    let config = &shared.config;
    let queue_depth = shared.queue_depth.load(Ordering::Relaxed);

    let secs = elapsed.as_secs_f64();
    #[allow(clippy::cast_precision_loss)]
    let publish_rate = if secs > 0.0 { count as f64 / secs } else { 0.0 };
    let avg_publish_latency = if count > 0 {
        Duration::from_nanos(total / count)
    } else {
        Duration::ZERO
    };

    let depth_breached = config.max_queue_depth > 0 && queue_depth > config.max_queue_depth;
    let latency_breached =
        !config.max_publish_latency.is_zero() && avg_publish_latency > config.max_publish_latency;
    let rate_breached = config.rate_threshold > 0.0 && publish_rate > config.rate_threshold;

    let mut ratio: f64 = 0.0;
    if config.max_queue_depth > 0 {
        #[allow(clippy::cast_precision_loss)]
        let depth = queue_depth as f64 / config.max_queue_depth as f64;
        ratio = ratio.max(depth);
    }
    if !config.max_publish_latency.is_zero() {
        ratio = ratio.max(avg_publish_latency.as_secs_f64() / config.max_publish_latency.as_secs_f64());
    }
    if config.rate_threshold > 0.0 {
        ratio = ratio.max(publish_rate / config.rate_threshold);
    }
    let backlog_ratio = ratio.clamp(0.0, 1.0);

    PublisherBacklogState {
        has_backlog: depth_breached || latency_breached || rate_breached,
        queue_depth,
        publish_rate,
        avg_publish_latency,
        backlog_ratio,
        severity: config.severity.classify(backlog_ratio),
        timestamp: Utc::now(),
    }
}

//! # Publisher-Side Health Checker
//!
//! Publishes a heartbeat every `interval` and drives the reconnect state
//! machine:
//!
//! ```text
//! Stopped ──start──► Running ──ok──► Healthy ◄──ok── Degraded
//!                                      │                ▲ │
//!                                      └──── fail ──────┘ │ failures >= threshold
//!                                                         ▼
//!                              Healthy ◄── ok ── Reconnecting ── exhausted ──► Failed
//! ```
//!
//! Status is written only by the checker task and read through a lock.
//! In `Failed` the checker keeps publishing heartbeats but no longer
//! attempts to reconnect; a successful heartbeat returns it to `Healthy`
//! and tells the recovery hook, which clears its terminal flag.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bus_types::{
    BusError, HealthCheckResult, HealthState, HealthStatus, TransportError, TransportKind,
};
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::message::HeartbeatMessage;
use super::HealthCheckConfig;
use crate::callbacks::CallbackList;
use crate::task::{ticker, BackgroundTask, TaskSlot};
use crate::transport::{OutboundMessage, Transport};

/// Invoked when consecutive failures reach the threshold.
#[async_trait]
pub trait Recovery: Send + Sync + 'static {
    /// Reconnect and restore subscriptions.
    async fn recover(&self) -> Result<(), BusError>;

    /// A heartbeat succeeded after recovery had given up.
    fn recovered(&self) {}
}

struct Shared {
    config: HealthCheckConfig,
    topic: String,
    source: String,
    failure_threshold: u32,
    transport: Arc<dyn Transport>,
    recovery: RwLock<Option<Arc<dyn Recovery>>>,
    status: RwLock<HealthStatus>,
    callbacks: CallbackList<HealthCheckResult>,
}

/// Periodic heartbeat publisher.
pub struct HealthChecker {
    shared: Arc<Shared>,
    task: TaskSlot,
}

impl HealthChecker {
    #[must_use]
    pub fn new(
        config: HealthCheckConfig,
        source: impl Into<String>,
        failure_threshold: u32,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let kind = transport.kind();
        let topic = config.resolved_topic(kind);
        let source = source.into();
        let status = HealthStatus {
            event_bus_type: kind,
            source: source.clone(),
            ..HealthStatus::default()
        };
        Self {
            shared: Arc::new(Shared {
                config,
                topic,
                source,
                failure_threshold: failure_threshold.max(1),
                transport,
                recovery: RwLock::new(None),
                status: RwLock::new(status),
                callbacks: CallbackList::new("health_check"),
            }),
            task: TaskSlot::default(),
        }
    }

    /// Install the reconnect hook.
    pub fn set_recovery(&self, recovery: Arc<dyn Recovery>) {
        *self.shared.recovery.write() = Some(recovery);
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    #[must_use]
    pub fn callbacks(&self) -> &CallbackList<HealthCheckResult> {
        &self.shared.callbacks
    }

    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.shared.status.read().clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Start the loop. The first check runs immediately.
    pub fn start(&self) -> Result<(), BusError> {
        let shared = self.shared.clone();
        let started = self.task.start_with(|| {
            {
                let mut status = shared.status.write();
                status.is_running = true;
                status.state = HealthState::Running;
            }
            BackgroundTask::spawn("health_checker", move |stop| run(shared, stop))
        });
        if !started {
            return Err(BusError::AlreadyRunning("health check publisher"));
        }
        info!(
            topic = %self.shared.topic,
            interval = ?self.shared.config.interval,
            "Health check publisher started"
        );
        Ok(())
    }

    /// Stop the loop and wait for it to exit. No-op when not running.
    pub async fn stop(&self) {
        if self.task.stop().await {
            let mut status = self.shared.status.write();
            status.is_running = false;
            status.state = HealthState::Stopped;
            info!(topic = %self.shared.topic, "Health check publisher stopped");
        }
    }

    /// Run one heartbeat check outside the loop.
    pub async fn check_once(&self) -> HealthCheckResult {
        check(&self.shared).await
    }
}

async fn run(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut interval = ticker(shared.config.interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }

        let result = check(&shared).await;
        let failures = result.consecutive_failures;
        shared.callbacks.notify(result).await;

        let state = shared.status.read().state;
        if failures >= shared.failure_threshold && state == HealthState::Degraded {
            let recovery = shared.recovery.read().clone();
            if let Some(recovery) = recovery {
                shared.status.write().state = HealthState::Reconnecting;
                warn!(failures, "Failure threshold reached, reconnecting");
                tokio::select! {
                    outcome = recovery.recover() => apply_recovery(&shared, outcome),
                    _ = stop.changed() => break,
                }
            }
        }
    }
    debug!(topic = %shared.topic, "Health check loop exited");
}

fn apply_recovery(shared: &Shared, outcome: Result<(), BusError>) {
    let mut status = shared.status.write();
    match outcome {
        Ok(()) => {
            status.consecutive_failures = 0;
            status.is_healthy = true;
            status.state = HealthState::Healthy;
            status.last_success_time = Some(Utc::now());
        }
        Err(e) => {
            status.is_healthy = false;
            status.state = HealthState::Failed;
            error!(error = %e, "Transport unrecoverable, giving up on reconnect");
        }
    }
}

async fn check(shared: &Shared) -> HealthCheckResult {
    let started = Instant::now();
    let outcome = publish_heartbeat(shared).await;
    let duration = started.elapsed();
    let now = Utc::now();

    let mut status = shared.status.write();
    status.last_check_time = Some(now);
    let revived = outcome.is_ok() && status.state == HealthState::Failed;
    let error = match outcome {
        Ok(()) => {
            status.consecutive_failures = 0;
            status.last_success_time = Some(now);
            status.is_healthy = true;
            status.state = HealthState::Healthy;
            debug!(topic = %shared.topic, ?duration, "Health check passed");
            None
        }
        Err(e) => {
            status.consecutive_failures += 1;
            status.last_failure_time = Some(now);
            status.is_healthy = status.consecutive_failures < shared.failure_threshold;
            if status.state != HealthState::Failed {
                status.state = HealthState::Degraded;
            }
            warn!(
                topic = %shared.topic,
                failures = status.consecutive_failures,
                error = %e,
                "Health check failed"
            );
            Some(e.to_string())
        }
    };

    let result = HealthCheckResult {
        success: error.is_none(),
        timestamp: now,
        duration,
        error,
        consecutive_failures: status.consecutive_failures,
        event_bus_type: status.event_bus_type,
        source: shared.source.clone(),
    };
    drop(status);

    if revived {
        info!(topic = %shared.topic, "Heartbeat succeeded after terminal failure");
        let recovery = shared.recovery.read().clone();
        if let Some(recovery) = recovery {
            recovery.recovered();
        }
    }
    result
}

async fn publish_heartbeat(shared: &Shared) -> Result<(), TransportError> {
    if !shared.transport.connection_state().is_connected {
        return Err(TransportError::NotConnected);
    }
    let kind: TransportKind = shared.transport.kind();
    let heartbeat = HeartbeatMessage::new(shared.source.clone(), kind)
        .with_metadata("checkType", "periodic");
    let payload = heartbeat
        .to_bytes()
        .map_err(|e| TransportError::Broker(e.to_string()))?;

    match tokio::time::timeout(
        shared.config.timeout,
        shared
            .transport
            .publish(&shared.topic, OutboundMessage::new(payload)),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(shared.config.timeout)),
    }
}

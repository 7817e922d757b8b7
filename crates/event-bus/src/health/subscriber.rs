//! Subscriber-side heartbeat monitoring.
//!
//! Every `monitor_interval` the subscriber compares the time since the last
//! valid heartbeat with the publisher's `interval`. Each overdue tick is a
//! miss; misses are classified against the warning/error/critical thresholds
//! and reported as [`HealthCheckAlert`]s. A valid heartbeat resets the count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bus_types::{
    AlertSeverity, BusError, HealthCheckAlert, HealthSubscriberStats, TransportKind,
};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::message::HeartbeatMessage;
use super::HealthCheckConfig;
use crate::callbacks::CallbackList;
use crate::task::{ticker, BackgroundTask, TaskSlot};
use crate::transport::{Completion, Delivery, DeliveryHandler, Transport};

/// Consumer tag of the heartbeat subscription.
const HEALTH_CONSUMER: &str = "health";
const ALERT_NO_MESSAGES: &str = "no_messages";

struct Shared {
    config: HealthCheckConfig,
    topic: String,
    source: String,
    kind: TransportKind,
    active: AtomicBool,
    stats: RwLock<HealthSubscriberStats>,
    callbacks: CallbackList<HealthCheckAlert>,
}

/// Watches the heartbeat topic and alerts on silence.
pub struct HealthCheckSubscriber {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    subscribed: AtomicBool,
    task: TaskSlot,
}

impl HealthCheckSubscriber {
    #[must_use]
    pub fn new(
        config: HealthCheckConfig,
        source: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let kind = transport.kind();
        let topic = config.resolved_topic(kind);
        Self {
            shared: Arc::new(Shared {
                config,
                topic,
                source: source.into(),
                kind,
                active: AtomicBool::new(false),
                stats: RwLock::new(HealthSubscriberStats {
                    start_time: None,
                    last_message_time: None,
                    total_messages_received: 0,
                    consecutive_misses: 0,
                    total_alerts: 0,
                    last_alert_time: None,
                    is_healthy: true,
                    uptime: Duration::ZERO,
                }),
                callbacks: CallbackList::new("health_alert"),
            }),
            transport,
            subscribed: AtomicBool::new(false),
            task: TaskSlot::default(),
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    #[must_use]
    pub fn callbacks(&self) -> &CallbackList<HealthCheckAlert> {
        &self.shared.callbacks
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Snapshot with `uptime` computed now.
    #[must_use]
    pub fn stats(&self) -> HealthSubscriberStats {
        let mut stats = self.shared.stats.read().clone();
        if let Some(start) = stats.start_time {
            stats.uptime = (Utc::now() - start).to_std().unwrap_or(Duration::ZERO);
        }
        stats
    }

    /// Subscribe to the heartbeat topic and start the monitor loop.
    pub async fn start(&self) -> Result<(), BusError> {
        if self.task.is_running() {
            return Err(BusError::AlreadyRunning("health check subscriber"));
        }
        if !self.subscribed.swap(true, Ordering::AcqRel) {
            if let Err(e) = self
                .transport
                .subscribe(
                    &self.shared.topic,
                    HEALTH_CONSUMER,
                    heartbeat_handler(self.shared.clone()),
                )
                .await
            {
                self.subscribed.store(false, Ordering::Release);
                return Err(e.into());
            }
        }

        {
            let mut stats = self.shared.stats.write();
            stats.start_time = Some(Utc::now());
            stats.consecutive_misses = 0;
            stats.is_healthy = true;
        }
        self.shared.active.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let started = self.task.start_with(|| {
            BackgroundTask::spawn("health_subscriber", move |stop| monitor(shared, stop))
        });
        if !started {
            return Err(BusError::AlreadyRunning("health check subscriber"));
        }
        info!(
            topic = %self.shared.topic,
            monitor_interval = ?self.shared.config.subscriber.monitor_interval,
            "Health check subscriber started"
        );
        Ok(())
    }

    /// Stop monitoring. Heartbeats arriving afterwards are ignored.
    pub async fn stop(&self) {
        self.shared.active.store(false, Ordering::Release);
        if self.task.stop().await {
            info!(topic = %self.shared.topic, "Health check subscriber stopped");
        }
    }

    /// Re-register the heartbeat subscription after a transport reconnect.
    pub async fn resubscribe(&self) -> Result<(), BusError> {
        if !self.subscribed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.transport
            .subscribe(
                &self.shared.topic,
                HEALTH_CONSUMER,
                heartbeat_handler(self.shared.clone()),
            )
            .await?;
        debug!(topic = %self.shared.topic, "Heartbeat subscription restored");
        Ok(())
    }

    /// Run one monitor tick outside the loop.
    pub async fn check_once(&self) -> Option<HealthCheckAlert> {
        tick(&self.shared).await
    }
}

fn heartbeat_handler(shared: Arc<Shared>) -> DeliveryHandler {
    Arc::new(move |delivery: Delivery| -> BoxFuture<'static, Completion> {
        on_heartbeat(&shared, &delivery.payload);
        async { async { Ok(()) }.boxed() }.boxed()
    })
}

fn on_heartbeat(shared: &Shared, payload: &[u8]) {
    if !shared.active.load(Ordering::Acquire) {
        return;
    }
    let message = match HeartbeatMessage::parse(payload, shared.config.message_ttl) {
        Ok(message) => message,
        Err(e) => {
            warn!(topic = %shared.topic, error = %e, "Discarding invalid heartbeat");
            return;
        }
    };
    let mut stats = shared.stats.write();
    stats.last_message_time = Some(Utc::now());
    stats.total_messages_received += 1;
    stats.consecutive_misses = 0;
    stats.is_healthy = true;
    debug!(
        topic = %shared.topic,
        message_id = %message.message_id,
        from = %message.source,
        "Heartbeat received"
    );
}

async fn monitor(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut interval = ticker(shared.config.subscriber.monitor_interval);
    // The first tick fires immediately; nothing can be overdue yet.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        tick(&shared).await;
    }
    debug!(topic = %shared.topic, "Health subscriber loop exited");
}

async fn tick(shared: &Shared) -> Option<HealthCheckAlert> {
    let now = Utc::now();
    let expected = shared.config.interval;
    let alert = {
        let mut stats = shared.stats.write();
        let reference = stats.last_message_time.or(stats.start_time)?;
        let silence = (now - reference).to_std().unwrap_or(Duration::ZERO);
        if silence <= expected {
            return None;
        }
        stats.consecutive_misses += 1;
        let misses = stats.consecutive_misses;
        let Some(severity) = shared.config.subscriber.classify(misses) else {
            debug!(topic = %shared.topic, misses, "Heartbeat overdue");
            return None;
        };
        stats.total_alerts += 1;
        stats.last_alert_time = Some(now);
        stats.is_healthy = severity != AlertSeverity::Critical;

        let mut metadata = HashMap::new();
        metadata.insert("eventBusType".to_string(), shared.kind.as_str().to_string());
        HealthCheckAlert {
            alert_type: ALERT_NO_MESSAGES.to_string(),
            severity,
            source: shared.source.clone(),
            topic: shared.topic.clone(),
            last_message_time: stats.last_message_time,
            time_since_last_message: silence,
            expected_interval: expected,
            consecutive_misses: misses,
            timestamp: now,
            metadata,
        }
    };

    match alert.severity {
        AlertSeverity::Warning => warn!(
            topic = %alert.topic,
            misses = alert.consecutive_misses,
            silence = ?alert.time_since_last_message,
            "Heartbeats missing"
        ),
        AlertSeverity::Error | AlertSeverity::Critical => error!(
            topic = %alert.topic,
            severity = ?alert.severity,
            misses = alert.consecutive_misses,
            silence = ?alert.time_since_last_message,
            "Heartbeats missing"
        ),
    }
    shared.callbacks.notify(alert.clone()).await;
    Some(alert)
}

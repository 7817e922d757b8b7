//! # In-Process Memory Transport
//!
//! Always connected, no network failure modes, health checks always pass.
//! Each subscription owns a bounded queue drained by one pump task, so
//! deliveries reach the handler in publish order. Every consumer of a topic
//! receives its own copy. Handler failures are logged; there is no
//! redelivery.
//!
//! `disconnect()` simulates losing the broker: the connection reports down
//! and every subscription is dropped until `reconnect()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus_types::{ConnectionState, TopicOptions, TransportError, TransportKind};
use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{spawn_ack, Delivery, DeliveryHandler, LagSample, OutboundMessage, Transport};

/// Memory transport tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTransportConfig {
    /// Queue capacity per subscription. A full queue blocks publishers.
    pub subscription_buffer: usize,
    /// Persistence reported for `PersistenceMode::Auto` topics.
    pub persistent_by_default: bool,
}

impl Default for MemoryTransportConfig {
    fn default() -> Self {
        Self {
            subscription_buffer: 1024,
            persistent_by_default: false,
        }
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    control_plane_calls: AtomicU64,
}

/// In-process broker.
pub struct MemoryTransport {
    config: MemoryTransportConfig,
    /// topic -> (consumer, queue)
    subscriptions: RwLock<HashMap<String, Vec<(String, mpsc::Sender<Delivery>)>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    topics: RwLock<HashMap<String, TopicOptions>>,
    state: RwLock<ConnectionState>,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MemoryTransportConfig::default())
    }

    #[must_use]
    pub fn with_config(config: MemoryTransportConfig) -> Self {
        Self {
            config,
            subscriptions: RwLock::new(HashMap::new()),
            pumps: Mutex::new(Vec::new()),
            topics: RwLock::new(HashMap::new()),
            state: RwLock::new(ConnectionState::connected()),
            closed: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Simulate losing the broker.
    pub fn disconnect(&self) {
        let mut state = self.state.write();
        state.is_connected = false;
        state.last_error = Some("simulated disconnect".to_string());
        drop(state);
        let dropped = self.drop_subscriptions();
        warn!(dropped, "Memory transport disconnected");
    }

    /// Active subscriptions across all topics.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().values().map(Vec::len).sum()
    }

    /// Consumer tags subscribed to `topic`, in subscription order.
    #[must_use]
    pub fn consumers(&self, topic: &str) -> Vec<String> {
        self.subscriptions
            .read()
            .get(topic)
            .map(|subs| subs.iter().map(|(consumer, _)| consumer.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.counters.published.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn delivered_count(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_count(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Number of describe/create/update calls served.
    #[must_use]
    pub fn control_plane_calls(&self) -> u64 {
        self.counters.control_plane_calls.load(Ordering::Relaxed)
    }

    fn drop_subscriptions(&self) -> usize {
        let removed = std::mem::take(&mut *self.subscriptions.write());
        removed.values().map(Vec::len).sum()
    }

    fn ensure_usable(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if !self.state.read().is_connected {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    fn count_control_plane_call(&self) {
        self.counters
            .control_plane_calls
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn pump(
    topic: String,
    mut rx: mpsc::Receiver<Delivery>,
    handler: DeliveryHandler,
    counters: Arc<Counters>,
) {
    while let Some(delivery) = rx.recv().await {
        let completion = handler(delivery).await;
        let counters = counters.clone();
        let topic = topic.clone();
        spawn_ack(completion, move |result| {
            async move {
                match result {
                    Ok(()) => {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(topic = %topic, error = %e, "Memory delivery failed, not redelivered");
                    }
                }
            }
            .boxed()
        });
    }
    debug!(topic = %topic, "Memory subscription pump exited");
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), TransportError> {
        self.ensure_usable()?;

        let senders: Vec<mpsc::Sender<Delivery>> = self
            .subscriptions
            .read()
            .get(topic)
            .map(|subs| subs.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();
        if senders.is_empty() {
            debug!(topic, "No subscribers for topic");
        }

        for sender in senders {
            let delivery = Delivery {
                topic: topic.to_string(),
                payload: message.payload.clone(),
                headers: message.headers.clone(),
                key: message.key.clone(),
                subject: None,
            };
            if sender.send(delivery).await.is_err() {
                debug!(topic, "Subscription dropped during publish");
            }
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        consumer: &str,
        handler: DeliveryHandler,
    ) -> Result<(), TransportError> {
        self.ensure_usable()?;

        let (tx, rx) = mpsc::channel(self.config.subscription_buffer.max(1));
        let handle = tokio::spawn(pump(topic.to_string(), rx, handler, self.counters.clone()));

        {
            let mut subscriptions = self.subscriptions.write();
            let subs = subscriptions.entry(topic.to_string()).or_default();
            // Dropping the old sender lets its pump drain and exit.
            if let Some(existing) = subs.iter_mut().find(|(c, _)| c == consumer) {
                warn!(topic, consumer, "Replacing existing memory subscription");
                existing.1 = tx;
            } else {
                subs.push((consumer.to_string(), tx));
            }
        }

        let mut pumps = self.pumps.lock();
        pumps.retain(|h| !h.is_finished());
        pumps.push(handle);

        debug!(topic, consumer, "Memory subscription added");
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.drop_subscriptions();

        let now = Utc::now();
        let mut state = self.state.write();
        state.is_connected = true;
        state.last_connected_time = Some(now);
        state.last_reconnect_time = Some(now);
        state.reconnect_count += 1;
        state.last_error = None;
        info!(reconnects = state.reconnect_count, "Memory transport reconnected");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.drop_subscriptions();
        self.state.write().is_connected = false;

        let pumps: Vec<JoinHandle<()>> = std::mem::take(&mut *self.pumps.lock());
        for handle in pumps {
            if let Err(e) = handle.await {
                warn!(error = %e, "Memory pump ended abnormally");
            }
        }
        info!("Memory transport closed");
        Ok(())
    }

    fn persistent_by_default(&self) -> bool {
        self.config.persistent_by_default
    }

    async fn describe_topic(&self, topic: &str) -> Result<Option<TopicOptions>, TransportError> {
        self.count_control_plane_call();
        Ok(self.topics.read().get(topic).cloned())
    }

    async fn create_topic(&self, topic: &str, options: &TopicOptions) -> Result<(), TransportError> {
        self.count_control_plane_call();
        let mut topics = self.topics.write();
        if topics.contains_key(topic) {
            return Err(TransportError::Broker(format!("topic {topic} already exists")));
        }
        topics.insert(topic.to_string(), options.clone());
        Ok(())
    }

    async fn update_topic(&self, topic: &str, options: &TopicOptions) -> Result<(), TransportError> {
        self.count_control_plane_call();
        match self.topics.write().get_mut(topic) {
            Some(existing) => {
                *existing = options.clone();
                Ok(())
            }
            None => Err(TransportError::Broker(format!("topic {topic} does not exist"))),
        }
    }

    async fn consumer_lag(&self, topic: &str) -> Result<Option<LagSample>, TransportError> {
        let subscriptions = self.subscriptions.read();
        let Some(senders) = subscriptions.get(topic) else {
            return Ok(None);
        };
        let queued: usize = senders
            .iter()
            .map(|(_, s)| s.max_capacity() - s.capacity())
            .sum();
        Ok(Some(LagSample {
            consumer_group: "memory".to_string(),
            lag_count: i64::try_from(queued).unwrap_or(i64::MAX),
            lag_time: Duration::ZERO,
        }))
    }
}

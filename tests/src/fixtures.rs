//! Shared builders and fakes for the integration scenarios.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus_types::{ConnectionState, TopicOptions, TransportError, TransportKind};
use event_bus::transport::LagSample;
use event_bus::{
    DeliveryHandler, EventBus, EventBusConfig, MemoryTransport, OutboundMessage, Transport,
};

/// Small pool and fast reconnect backoff.
#[must_use]
pub fn test_config() -> EventBusConfig {
    let mut config = EventBusConfig::default();
    config.worker_pool.worker_count = 8;
    config.worker_pool.queue_size = 64;
    config.default_publish_timeout = Duration::from_secs(2);
    config.reconnect.initial_backoff = Duration::from_millis(10);
    config.reconnect.max_backoff = Duration::from_millis(40);
    config.reconnect.max_attempts = 5;
    config
}

/// Bus on a fresh memory transport, returning both.
#[must_use]
pub fn memory_bus(config: EventBusConfig) -> (EventBus, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let bus = EventBus::with_transport(config, transport.clone()).expect("valid config");
    (bus, transport)
}

/// Poll `condition` every 5ms, panicking after `limit`.
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, condition: F) {
    let polled = tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not met within {limit:?}");
}

/// Callback body that bumps a counter.
pub fn counting<T>(counter: Arc<AtomicU64>) -> impl Fn(T) -> futures::future::Ready<anyhow::Result<()>> {
    move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok(()))
    }
}

/// Memory transport whose `reconnect` fails a scripted number of times.
pub struct FlakyTransport {
    inner: Arc<MemoryTransport>,
    failures_left: AtomicU32,
    reconnect_calls: AtomicU32,
}

impl FlakyTransport {
    #[must_use]
    pub fn new(inner: Arc<MemoryTransport>, failing_reconnects: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failing_reconnects),
            reconnect_calls: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn reconnect_calls(&self) -> u32 {
        self.reconnect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect(&self) {
        self.inner.disconnect();
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), TransportError> {
        self.inner.publish(topic, message).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        consumer: &str,
        handler: DeliveryHandler,
    ) -> Result<(), TransportError> {
        // Give other reconnect callers a chance to interleave.
        tokio::task::yield_now().await;
        self.inner.subscribe(topic, consumer, handler).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Broker("broker unreachable".into()));
        }
        self.inner.reconnect().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    async fn describe_topic(&self, topic: &str) -> Result<Option<TopicOptions>, TransportError> {
        self.inner.describe_topic(topic).await
    }

    async fn create_topic(&self, topic: &str, options: &TopicOptions) -> Result<(), TransportError> {
        self.inner.create_topic(topic, options).await
    }

    async fn update_topic(&self, topic: &str, options: &TopicOptions) -> Result<(), TransportError> {
        self.inner.update_topic(topic, options).await
    }

    async fn consumer_lag(&self, topic: &str) -> Result<Option<LagSample>, TransportError> {
        self.inner.consumer_lag(topic).await
    }
}

/// Run `f` on a multi-threaded runtime inside a timeout.
pub async fn bounded<F: Future>(limit: Duration, f: F) -> F::Output {
    tokio::time::timeout(limit, f)
        .await
        .expect("scenario exceeded its time limit")
}

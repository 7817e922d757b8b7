//! # EventBus Facade
//!
//! Composes a transport with the ordering engine and the operational loops:
//!
//! ```text
//!  publish ─────────────► Transport ──► broker
//!  publish_envelope ─► Envelope::to_bytes ─┘
//!
//!  broker ─► Transport ─► RateLimiter ─► raw handler (spawned, unordered)
//!                                   └─► Envelope::from_bytes ─► KeyedWorkerPool ─► envelope handler
//!
//!  HealthChecker ── failures >= threshold ──► reconnect ─► replay subscriptions ─► callbacks
//! ```
//!
//! The facade, not the transport, records every subscription so that replay
//! after a reconnect works the same for every adapter. Each subscription
//! reaches the transport under its kind's consumer tag, so a raw and an
//! envelope subscription on one topic keep separate broker-side consumers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bus_types::{
    BacklogState, BusError, BusMetrics, ConnectionState, Envelope, HealthCheckAlert,
    HealthCheckResult, HealthStatus, HealthSubscriberStats, PublishOptions, PublishResult,
    PublisherBacklogState, ReconnectStatus, TopicConfigError, TopicConfigStrategy, TopicOptions,
    TopicSyncResult, TransportError, TransportKind,
};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::backlog::{PublisherBacklogDetector, SubscriberBacklogDetector, TransportLagSource};
use crate::config::EventBusConfig;
use crate::extract::{SubjectPattern, AGGREGATE_ID_HEADER};
use crate::health::{HealthCheckSubscriber, HealthChecker, Recovery};
use crate::keyed_pool::{KeyedWorkerPool, WorkerStats};
use crate::rate_limit::{RateLimiter, RateLimiterStats};
use crate::reconnect::ReconnectController;
use crate::topic_config::TopicConfigManager;
use crate::transport::{
    Completion, Delivery, DeliveryHandler, MemoryTransport, OutboundMessage, Transport,
};

/// Buffered publish results per receiver before the oldest are dropped.
const PUBLISH_RESULT_CAPACITY: usize = 1024;

/// How a topic is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Bytes straight to the handler, concurrently.
    Raw,
    /// Envelopes through the keyed worker pool.
    Envelope,
}

impl SubscriptionKind {
    /// Consumer tag handed to the transport.
    #[must_use]
    pub fn consumer_tag(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Envelope => "envelope",
        }
    }
}

struct Subscription {
    topic: String,
    kind: SubscriptionKind,
    handler: DeliveryHandler,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    consumed: AtomicU64,
    publish_errors: AtomicU64,
    consume_errors: AtomicU64,
    connection_errors: AtomicU64,
}

impl Counters {
    fn record_consume(&self, result: &anyhow::Result<()>) {
        match result {
            Ok(()) => self.consumed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.consume_errors.fetch_add(1, Ordering::Relaxed),
        };
    }
}

struct Inner {
    config: EventBusConfig,
    transport: Arc<dyn Transport>,
    pool: Arc<KeyedWorkerPool>,
    limiter: Arc<RateLimiter>,
    subscriptions: Mutex<Vec<Subscription>>,
    topics: TopicConfigManager,
    health: HealthChecker,
    health_subscriber: HealthCheckSubscriber,
    reconnect: ReconnectController,
    publisher_backlog: PublisherBacklogDetector,
    subscriber_backlog: SubscriberBacklogDetector,
    counters: Arc<Counters>,
    results: broadcast::Sender<PublishResult>,
    closed: AtomicBool,
}

impl Inner {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    async fn send(
        &self,
        topic: &str,
        message: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), BusError> {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, self.transport.publish(topic, message))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BusError::from(e)),
            Err(_) => Err(BusError::PublishTimeout {
                topic: topic.to_string(),
                timeout,
            }),
        };

        match &outcome {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                self.publisher_backlog.record_publish(started.elapsed());
                debug!(topic, "Published");
            }
            Err(e) => {
                self.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
                if matches!(e, BusError::Transport(TransportError::NotConnected)) {
                    self.counters.connection_errors.fetch_add(1, Ordering::Relaxed);
                }
                warn!(topic, error = %e, "Publish failed");
            }
        }
        outcome
    }

    async fn add_subscription(
        &self,
        topic: &str,
        kind: SubscriptionKind,
        handler: DeliveryHandler,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        if topic.trim().is_empty() {
            return Err(TopicConfigError::EmptyTopic.into());
        }
        {
            let mut subscriptions = self.subscriptions.lock();
            if subscriptions
                .iter()
                .any(|s| s.topic == topic && s.kind == kind)
            {
                return Err(BusError::AlreadySubscribed(topic.to_string()));
            }
            subscriptions.push(Subscription {
                topic: topic.to_string(),
                kind,
                handler: handler.clone(),
            });
        }

        if let Err(e) = self
            .transport
            .subscribe(topic, kind.consumer_tag(), handler)
            .await
        {
            self.subscriptions
                .lock()
                .retain(|s| !(s.topic == topic && s.kind == kind));
            warn!(topic, error = %e, "Subscribe failed");
            return Err(e.into());
        }
        self.subscriber_backlog.watch_topic(topic);
        info!(topic, ?kind, "Subscribed");
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), BusError> {
        let result = self
            .reconnect
            .reconnect(self.transport.as_ref(), || self.replay())
            .await;
        if result.is_err() {
            self.counters
                .connection_errors
                .fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Re-issue every recorded subscription on the fresh connection.
    async fn replay(&self) -> Result<usize, BusError> {
        let recorded: Vec<(String, SubscriptionKind, DeliveryHandler)> = self
            .subscriptions
            .lock()
            .iter()
            .map(|s| (s.topic.clone(), s.kind, s.handler.clone()))
            .collect();

        let mut restored = 0;
        let mut first_error = None;
        for (topic, kind, handler) in recorded {
            match self
                .transport
                .subscribe(&topic, kind.consumer_tag(), handler)
                .await
            {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Subscription replay failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Err(e) = self.health_subscriber.resubscribe().await {
            warn!(error = %e, "Heartbeat subscription replay failed");
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(restored),
        }
    }
}

struct BusRecovery(Weak<Inner>);

#[async_trait]
impl Recovery for BusRecovery {
    async fn recover(&self) -> Result<(), BusError> {
        match self.0.upgrade() {
            Some(inner) => inner.reconnect().await,
            None => Err(BusError::Closed),
        }
    }

    fn recovered(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.reconnect.mark_recovered();
        }
    }
}

fn failed(error: anyhow::Error) -> Completion {
    async move { Err(error) }.boxed()
}

fn tracked(
    completion: Completion,
    counters: Arc<Counters>,
    limiter: Arc<RateLimiter>,
) -> Completion {
    async move {
        let result = completion.await;
        counters.record_consume(&result);
        limiter.record_outcome(result.is_ok());
        result
    }
    .boxed()
}

fn raw_handler<F, Fut>(
    handler: F,
    counters: Arc<Counters>,
    limiter: Arc<RateLimiter>,
) -> DeliveryHandler
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |delivery: Delivery| -> BoxFuture<'static, Completion> {
        let handler = handler.clone();
        let counters = counters.clone();
        let limiter = limiter.clone();
        async move {
            limiter.acquire().await;
            let running = tokio::spawn((*handler)(delivery.payload));
            let completion = async move {
                match running.await {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("handler task failed: {e}")),
                }
            }
            .boxed();
            tracked(completion, counters, limiter)
        }
        .boxed()
    })
}

fn envelope_handler<F, Fut>(
    handler: F,
    pool: Arc<KeyedWorkerPool>,
    counters: Arc<Counters>,
    limiter: Arc<RateLimiter>,
    pattern: SubjectPattern,
) -> DeliveryHandler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |delivery: Delivery| -> BoxFuture<'static, Completion> {
        let handler = handler.clone();
        let pool = pool.clone();
        let counters = counters.clone();
        let limiter = limiter.clone();
        async move {
            limiter.acquire().await;
            let envelope = match Envelope::from_bytes(&delivery.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    counters.consume_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = %delivery.topic, error = %e, "Rejecting undecodable envelope");
                    return failed(e.into());
                }
            };
            let aggregate_id = match delivery.aggregate_id(pattern) {
                Ok(id) => id,
                Err(e) => {
                    counters.consume_errors.fetch_add(1, Ordering::Relaxed);
                    return failed(e.into());
                }
            };

            let job = (*handler)(envelope).boxed();
            match pool.submit(&aggregate_id, job).await {
                Ok(completion) => tracked(completion, counters, limiter),
                Err(e) => {
                    counters.consume_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(aggregate_id = %aggregate_id, error = %e, "Dispatch to worker failed");
                    failed(e.into())
                }
            }
        }
        .boxed()
    })
}

/// Broker-agnostic event bus. Cheap to clone; clones share one bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Validate `config`, connect the configured transport and build the bus.
    pub async fn new(config: EventBusConfig) -> Result<Self, BusError> {
        config.validate()?;
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Memory => Arc::new(MemoryTransport::with_config(config.memory.clone())),
            TransportKind::Nats => connect_nats(&config).await?,
            TransportKind::Kafka => connect_kafka(&config)?,
        };
        Self::with_transport(config, transport)
    }

    /// Build the bus on an existing transport. Must be called inside a
    /// Tokio runtime.
    pub fn with_transport(
        config: EventBusConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BusError> {
        config.validate()?;
        let (results, _) = broadcast::channel(PUBLISH_RESULT_CAPACITY);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let health = HealthChecker::new(
                config.health_check.clone(),
                config.service_name.clone(),
                config.reconnect.failure_threshold,
                transport.clone(),
            );
            health.set_recovery(Arc::new(BusRecovery(weak.clone())));

            Inner {
                transport: transport.clone(),
                pool: Arc::new(KeyedWorkerPool::new(config.worker_pool.clone())),
                limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
                subscriptions: Mutex::new(Vec::new()),
                topics: TopicConfigManager::new(config.topic_config.clone(), transport.clone()),
                health,
                health_subscriber: HealthCheckSubscriber::new(
                    config.health_check.clone(),
                    config.service_name.clone(),
                    transport.clone(),
                ),
                reconnect: ReconnectController::new(config.reconnect.clone()),
                publisher_backlog: PublisherBacklogDetector::new(config.publisher_backlog.clone()),
                subscriber_backlog: SubscriberBacklogDetector::new(
                    config.subscriber_backlog.clone(),
                    Arc::new(TransportLagSource(transport.clone())),
                ),
                counters: Arc::new(Counters::default()),
                results,
                closed: AtomicBool::new(false),
                config,
            }
        });

        info!(
            transport = %inner.transport.kind(),
            workers = inner.pool.worker_count(),
            "Event bus created"
        );
        Ok(Self { inner })
    }

    // =========================================================================
    // PUBLISH / SUBSCRIBE
    // =========================================================================

    /// Publish raw bytes with the default timeout.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        self.inner
            .send(
                topic,
                OutboundMessage::new(payload),
                self.inner.config.default_publish_timeout,
            )
            .await
    }

    /// Publish raw bytes with headers, timeout and retry.
    pub async fn publish_with_options(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        let mut message = OutboundMessage::new(payload);
        message.headers = options.metadata;
        if let Some(id) = options.aggregate_id {
            message
                .headers
                .insert(AGGREGATE_ID_HEADER.to_string(), id.clone());
            message.key = Some(id);
        }
        let timeout = options
            .timeout
            .unwrap_or(self.inner.config.default_publish_timeout);
        let policy = options.retry_policy;

        let mut retry = 0;
        loop {
            match self.inner.send(topic, message.clone(), timeout).await {
                Ok(()) => return Ok(()),
                Err(e) if retry < policy.max_retries && is_retryable(&e) => {
                    retry += 1;
                    let delay = policy.backoff(retry);
                    debug!(topic, retry, ?delay, error = %e, "Retrying publish");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Validate, encode and publish `envelope`, keyed by its aggregate id.
    ///
    /// Every attempt that reaches the transport is reported on
    /// [`publish_results`](Self::publish_results).
    pub async fn publish_envelope(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        let payload = envelope.to_bytes()?;
        let mut message = OutboundMessage::new(payload);
        message
            .headers
            .insert(AGGREGATE_ID_HEADER.to_string(), envelope.aggregate_id.clone());
        message.key = Some(envelope.aggregate_id.clone());

        let outcome = self
            .inner
            .send(topic, message, self.inner.config.default_publish_timeout)
            .await;

        let result = PublishResult {
            event_id: envelope.event_id.clone(),
            topic: topic.to_string(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
            timestamp: Utc::now(),
            aggregate_id: envelope.aggregate_id.clone(),
            event_type: envelope.event_type.clone(),
        };
        // No receivers is fine.
        let _ = self.inner.results.send(result);
        outcome
    }

    /// Stream of [`PublishResult`]s from `publish_envelope`. Slow receivers
    /// observe a lag error and skip ahead.
    #[must_use]
    pub fn publish_results(&self) -> BroadcastStream<PublishResult> {
        BroadcastStream::new(self.inner.results.subscribe())
    }

    /// Consume raw bytes. Deliveries run concurrently with no ordering.
    pub async fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> Result<(), BusError>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = raw_handler(
            handler,
            self.inner.counters.clone(),
            self.inner.limiter.clone(),
        );
        self.inner
            .add_subscription(topic, SubscriptionKind::Raw, handler)
            .await
    }

    /// Consume envelopes, in order per aggregate id.
    pub async fn subscribe_envelope<F, Fut>(&self, topic: &str, handler: F) -> Result<(), BusError>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = envelope_handler(
            handler,
            self.inner.pool.clone(),
            self.inner.counters.clone(),
            self.inner.limiter.clone(),
            self.inner.config.subject_pattern,
        );
        self.inner
            .add_subscription(topic, SubscriptionKind::Envelope, handler)
            .await
    }

    /// Envelope publish and subscribe are always available.
    #[must_use]
    pub fn supports_envelopes(&self) -> bool {
        true
    }

    // =========================================================================
    // TOPIC CONFIGURATION
    // =========================================================================

    pub async fn configure_topic(
        &self,
        topic: &str,
        options: TopicOptions,
    ) -> Result<TopicSyncResult, BusError> {
        self.inner.ensure_open()?;
        Ok(self.inner.topics.configure(topic, options).await?)
    }

    pub async fn set_topic_persistence(
        &self,
        topic: &str,
        persistent: bool,
    ) -> Result<TopicSyncResult, BusError> {
        self.inner.ensure_open()?;
        Ok(self.inner.topics.set_persistence(topic, persistent).await?)
    }

    pub fn get_topic_config(&self, topic: &str) -> Result<TopicOptions, BusError> {
        Ok(self.inner.topics.get(topic)?)
    }

    #[must_use]
    pub fn list_configured_topics(&self) -> Vec<String> {
        self.inner.topics.list()
    }

    pub fn remove_topic_config(&self, topic: &str) -> Result<(), BusError> {
        Ok(self.inner.topics.remove(topic)?)
    }

    pub fn set_topic_config_strategy(&self, strategy: TopicConfigStrategy) {
        self.inner.topics.set_strategy(strategy);
    }

    #[must_use]
    pub fn topic_config_strategy(&self) -> TopicConfigStrategy {
        self.inner.topics.strategy()
    }

    // =========================================================================
    // HEALTH AND RECONNECT
    // =========================================================================

    /// Start the heartbeat publisher.
    pub fn start_health_check(&self) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        self.inner.health.start()
    }

    /// Stop the heartbeat publisher and wait for its loop to exit.
    pub async fn stop_health_check(&self) {
        self.inner.health.stop().await;
    }

    pub async fn start_health_check_subscriber(&self) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        self.inner.health_subscriber.start().await
    }

    pub async fn stop_health_check_subscriber(&self) {
        self.inner.health_subscriber.stop().await;
    }

    /// Start both heartbeat roles.
    pub async fn start_all_health_check(&self) -> Result<(), BusError> {
        self.start_health_check()?;
        self.start_health_check_subscriber().await
    }

    pub async fn stop_all_health_check(&self) {
        self.stop_health_check().await;
        self.stop_health_check_subscriber().await;
    }

    #[must_use]
    pub fn get_health_status(&self) -> HealthStatus {
        self.inner.health.status()
    }

    #[must_use]
    pub fn health_subscriber_stats(&self) -> HealthSubscriberStats {
        self.inner.health_subscriber.stats()
    }

    pub fn register_health_check_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(HealthCheckResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.health.callbacks().register(callback);
    }

    pub fn register_health_alert_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(HealthCheckAlert) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.health_subscriber.callbacks().register(callback);
    }

    /// Runs after every successful reconnect, once subscriptions are restored.
    pub fn register_reconnect_callback<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .reconnect
            .callbacks()
            .register(move |()| callback());
    }

    #[must_use]
    pub fn get_connection_state(&self) -> ConnectionState {
        self.inner.transport.connection_state()
    }

    #[must_use]
    pub fn reconnect_status(&self) -> ReconnectStatus {
        self.inner.reconnect.status()
    }

    /// Reconnect now and replay subscriptions, without waiting for the
    /// health checker to notice a failure.
    pub async fn reconnect(&self) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        self.inner.reconnect().await
    }

    // =========================================================================
    // BACKLOG MONITORING
    // =========================================================================

    pub fn register_backlog_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(BacklogState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.subscriber_backlog.callbacks().register(callback);
    }

    pub fn register_publisher_backlog_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(PublisherBacklogState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.publisher_backlog.callbacks().register(callback);
    }

    /// Start the subscriber-side (consumer lag) detector.
    pub fn start_backlog_monitoring(&self) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        self.inner.subscriber_backlog.start()
    }

    pub async fn stop_backlog_monitoring(&self) {
        self.inner.subscriber_backlog.stop().await;
    }

    pub fn start_publisher_backlog_monitoring(&self) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        self.inner.publisher_backlog.start()
    }

    pub async fn stop_publisher_backlog_monitoring(&self) {
        self.inner.publisher_backlog.stop().await;
    }

    pub fn start_all_backlog_monitoring(&self) -> Result<(), BusError> {
        self.start_backlog_monitoring()?;
        self.start_publisher_backlog_monitoring()
    }

    pub async fn stop_all_backlog_monitoring(&self) {
        self.stop_backlog_monitoring().await;
        self.stop_publisher_backlog_monitoring().await;
    }

    /// Report the caller's own outbound queue to the publisher detector.
    pub fn update_publisher_queue_depth(&self, depth: i64) {
        self.inner.publisher_backlog.update_queue_depth(depth);
    }

    #[must_use]
    pub fn publisher_backlog_state(&self) -> PublisherBacklogState {
        self.inner.publisher_backlog.state()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Configure the topics listed in the config and re-apply any recorded
    /// since, then start every loop the config enables. Every topic is
    /// attempted; the first failure is returned.
    pub async fn start(&self) -> Result<(), BusError> {
        self.inner.ensure_open()?;
        let synced = self.inner.topics.sync_all(&self.inner.config.topics).await;
        if let Some(e) = synced.into_iter().find_map(Result::err) {
            return Err(e.into());
        }
        if self.inner.config.health_check.enabled {
            self.start_all_health_check().await?;
        }
        if self.inner.config.publisher_backlog.enabled {
            self.start_publisher_backlog_monitoring()?;
        }
        if self.inner.config.subscriber_backlog.enabled {
            self.start_backlog_monitoring()?;
        }
        info!(
            topics = self.inner.config.topics.len(),
            "Event bus started"
        );
        Ok(())
    }

    /// Stop every background loop. The transport stays open.
    pub async fn stop(&self) {
        self.stop_all_health_check().await;
        self.stop_all_backlog_monitoring().await;
        debug!("Event bus loops stopped");
    }

    /// Stop the loops, close the transport, then drain the worker pool.
    /// Idempotent.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop().await;
        let closed = self.inner.transport.close().await;
        self.inner.pool.close().await;
        self.inner.subscriptions.lock().clear();
        info!("Event bus closed");
        closed.map_err(Into::into)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    #[must_use]
    pub fn metrics(&self) -> BusMetrics {
        let counters = &self.inner.counters;
        BusMetrics {
            messages_published: counters.published.load(Ordering::Relaxed),
            messages_consumed: counters.consumed.load(Ordering::Relaxed),
            publish_errors: counters.publish_errors.load(Ordering::Relaxed),
            consume_errors: counters.consume_errors.load(Ordering::Relaxed),
            connection_errors: counters.connection_errors.load(Ordering::Relaxed),
            last_health_check: self.inner.health.status().last_check_time,
            active_subscriptions: self.inner.subscriptions.lock().len(),
        }
    }

    #[must_use]
    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.inner.pool.stats()
    }

    #[must_use]
    pub fn rate_limiter_stats(&self) -> RateLimiterStats {
        self.inner.limiter.stats()
    }

    /// Change the consume rate at runtime. Ignored when rate limiting is
    /// disabled.
    pub fn set_rate_limit(&self, rate_per_second: f64) {
        self.inner.limiter.set_rate(rate_per_second);
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    #[must_use]
    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }
}

fn is_retryable(error: &BusError) -> bool {
    match error {
        BusError::PublishTimeout { .. } => true,
        BusError::Transport(e) => !matches!(e, TransportError::Closed | TransportError::Unsupported(_)),
        _ => false,
    }
}

#[cfg(feature = "nats")]
async fn connect_nats(config: &EventBusConfig) -> Result<Arc<dyn Transport>, BusError> {
    let transport = crate::transport::NatsTransport::connect(config.nats.clone()).await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "nats"))]
async fn connect_nats(_config: &EventBusConfig) -> Result<Arc<dyn Transport>, BusError> {
    Err(TransportError::Unsupported("built without the nats feature").into())
}

#[cfg(feature = "kafka")]
fn connect_kafka(config: &EventBusConfig) -> Result<Arc<dyn Transport>, BusError> {
    let transport = crate::transport::KafkaTransport::new(config.kafka.clone())?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "kafka"))]
fn connect_kafka(_config: &EventBusConfig) -> Result<Arc<dyn Transport>, BusError> {
    Err(TransportError::Unsupported("built without the kafka feature").into())
}

//! # Kafka Transport
//!
//! Publishes through one idempotent `FutureProducer`, keyed by the
//! aggregate id so one aggregate always lands on one partition. Each
//! subscription runs its own `StreamConsumer` in the group
//! `<group_id>-<consumer>` with auto-commit disabled, so two consumers of
//! one topic keep separate offsets.
//!
//! Commits go through an [`OffsetTracker`]: a partition's offset advances
//! only past deliveries that have all completed `Ok`. A failed delivery
//! seeks the partition back and is redelivered up to `max_redeliveries`
//! times, after which it is skipped with an error log.
//!
//! Kafka topics are always durable, so `PersistenceMode` only affects
//! retention settings chosen by the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus_types::{
    Compression, ConnectionState, PersistenceMode, TopicOptions, TransportError, TransportKind,
};
use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rdkafka::admin::{
    AdminClient, AdminOptions, AlterConfig, NewPartitions, NewTopic, ResourceSpecifier,
    TopicReplication,
};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::offsets::{OffsetTracker, Progress};
use super::{spawn_ack, Delivery, DeliveryHandler, LagSample, OutboundMessage, Transport};
use crate::config::KafkaConfig;
use crate::task::BackgroundTask;

struct Subscription {
    consumer: Arc<StreamConsumer>,
    task: BackgroundTask,
}

/// Kafka-backed transport.
pub struct KafkaTransport {
    config: KafkaConfig,
    producer: RwLock<Option<FutureProducer>>,
    admin: Arc<AdminClient<DefaultClientContext>>,
    /// (topic, consumer) -> consumer loop
    subscriptions: Mutex<HashMap<(String, String), Subscription>>,
    state: RwLock<ConnectionState>,
    closed: AtomicBool,
}

impl KafkaTransport {
    /// Build the producer and admin clients. librdkafka connects lazily,
    /// so broker reachability is only known after the first call.
    pub fn new(config: KafkaConfig) -> Result<Self, TransportError> {
        let producer = producer_config(&config).create().map_err(broker)?;
        let admin = base_config(&config).create().map_err(broker)?;
        info!(brokers = ?config.brokers, "Kafka clients created");
        Ok(Self {
            config,
            producer: RwLock::new(Some(producer)),
            admin: Arc::new(admin),
            subscriptions: Mutex::new(HashMap::new()),
            state: RwLock::new(ConnectionState::connected()),
            closed: AtomicBool::new(false),
        })
    }

    fn producer(&self) -> Result<FutureProducer, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.producer
            .read()
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn record_result(&self, result: &Result<(), TransportError>) {
        let mut state = self.state.write();
        match result {
            Ok(()) => {
                state.is_connected = true;
                state.last_error = None;
            }
            Err(e) => state.last_error = Some(e.to_string()),
        }
    }

    fn consumer(&self, topic: &str, group: &str) -> Result<StreamConsumer, TransportError> {
        let mut config = base_config(&self.config);
        config
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set(
                "session.timeout.ms",
                self.config.session_timeout.as_millis().to_string(),
            );
        let consumer: StreamConsumer = config.create().map_err(broker)?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        Ok(consumer)
    }

    async fn stop_consumers(&self) -> usize {
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .drain()
            .map(|(_, s)| s)
            .collect();
        let count = subscriptions.len();
        for subscription in subscriptions {
            subscription.task.stop().await;
            subscription.consumer.unsubscribe();
        }
        count
    }

    fn admin_options(&self) -> AdminOptions {
        AdminOptions::new().request_timeout(Some(self.config.request_timeout))
    }
}

fn broker(error: impl std::fmt::Display) -> TransportError {
    TransportError::Broker(error.to_string())
}

/// One consumer group per consumer tag, so each keeps its own offsets.
fn group_for(group_id: &str, consumer: &str) -> String {
    format!("{group_id}-{consumer}")
}

fn base_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.brokers.join(","))
        .set("client.id", &config.client_id);
    client
}

fn producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = base_config(config);
    client
        .set("enable.idempotence", config.enable_idempotence.to_string())
        .set(
            "message.timeout.ms",
            config.request_timeout.as_millis().to_string(),
        );
    client
}

fn retention_ms(options: &TopicOptions) -> String {
    if options.retention_time.is_zero() {
        "-1".to_string()
    } else {
        options.retention_time.as_millis().to_string()
    }
}

fn retention_bytes(options: &TopicOptions) -> String {
    if options.max_size == 0 {
        "-1".to_string()
    } else {
        options.max_size.to_string()
    }
}

fn compression_from(value: &str) -> Compression {
    match value {
        "gzip" => Compression::Gzip,
        "snappy" => Compression::Snappy,
        "lz4" => Compression::Lz4,
        "zstd" => Compression::Zstd,
        _ => Compression::None,
    }
}

fn compression_setting(compression: Compression) -> &'static str {
    match compression {
        Compression::None => "producer",
        other => other.as_str(),
    }
}

fn delivery_from(message: &OwnedMessage) -> Delivery {
    let mut headers = HashMap::new();
    if let Some(owned) = message.headers() {
        for header in owned.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }
    Delivery {
        topic: message.topic().to_string(),
        payload: message.payload().unwrap_or_default().to_vec(),
        headers,
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        subject: None,
    }
}

fn commit(consumer: &StreamConsumer, topic: &str, partition: i32, next: i64) {
    let mut offsets = TopicPartitionList::new();
    if let Err(e) = offsets.add_partition_offset(topic, partition, Offset::Offset(next)) {
        warn!(topic, error = %e, "Invalid commit offset");
        return;
    }
    if let Err(e) = consumer.commit(&offsets, CommitMode::Async) {
        warn!(topic, partition, offset = next, error = %e, "Offset commit failed");
    }
}

async fn rewind(
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
    timeout: Duration,
) {
    let sought = tokio::task::spawn_blocking(move || {
        consumer.seek(&topic, partition, Offset::Offset(offset), timeout)
    })
    .await;
    match sought {
        Ok(Ok(())) => debug!(partition, offset, "Partition rewound for redelivery"),
        Ok(Err(e)) => warn!(partition, offset, error = %e, "Seek for redelivery failed"),
        Err(e) => warn!(partition, offset, error = %e, "Seek task failed"),
    }
}

async fn consume(
    consumer: Arc<StreamConsumer>,
    handler: DeliveryHandler,
    max_redeliveries: u32,
    seek_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let tracker = Arc::new(Mutex::new(OffsetTracker::new(max_redeliveries)));
    loop {
        let received = tokio::select! {
            received = consumer.recv() => received.map(|m| m.detach()),
            _ = stop.changed() => break,
        };
        let message = match received {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Kafka receive failed");
                continue;
            }
        };

        let topic = message.topic().to_string();
        let partition = message.partition();
        let offset = message.offset();
        let Some(ticket) = tracker.lock().track(partition, offset) else {
            debug!(topic = %topic, partition, offset, "Dropping delivery fetched before rewind");
            continue;
        };
        let completion = handler(delivery_from(&message)).await;

        let consumer = consumer.clone();
        let tracker = tracker.clone();
        spawn_ack(completion, move |result| {
            async move {
                if let Err(e) = &result {
                    warn!(topic = %topic, partition, offset, error = %e, "Handler failed");
                }
                let failures = tracker.lock().failures(partition, offset);
                let progress = tracker.lock().complete(ticket, result.is_ok());
                match progress {
                    Progress::Idle => {}
                    Progress::Commit(next) => {
                        if result.is_err() {
                            error!(topic = %topic, partition, offset, failures, "Redeliveries exhausted, skipping offset");
                        }
                        commit(&consumer, &topic, partition, next);
                    }
                    Progress::Rewind(to) => {
                        rewind(consumer, topic, partition, to, seek_timeout).await;
                    }
                }
            }
            .boxed()
        });
    }
    debug!("Kafka consumer exited");
}

#[async_trait]
impl Transport for KafkaTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Kafka
    }

    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), TransportError> {
        let producer = self.producer()?;
        let mut headers = OwnedHeaders::new();
        for (name, value) in &message.headers {
            headers = headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic)
            .payload(message.payload.as_slice())
            .headers(headers);
        if let Some(key) = &message.key {
            record = record.key(key.as_str());
        }

        let result = producer
            .send(record, self.config.request_timeout)
            .await
            .map(|_| ())
            .map_err(|(e, _)| broker(e));
        self.record_result(&result);
        result
    }

    async fn subscribe(
        &self,
        topic: &str,
        consumer: &str,
        handler: DeliveryHandler,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let group = group_for(&self.config.group_id, consumer);
        let kafka_consumer = Arc::new(self.consumer(topic, &group)?);
        let task = {
            let kafka_consumer = kafka_consumer.clone();
            let max_redeliveries = self.config.max_redeliveries;
            let seek_timeout = self.config.request_timeout;
            BackgroundTask::spawn("kafka_consumer", move |stop| {
                consume(kafka_consumer, handler, max_redeliveries, seek_timeout, stop)
            })
        };
        let previous = self.subscriptions.lock().insert(
            (topic.to_string(), consumer.to_string()),
            Subscription {
                consumer: kafka_consumer,
                task,
            },
        );
        if let Some(previous) = previous {
            warn!(topic, consumer, "Replacing existing Kafka consumer");
            previous.task.stop().await;
            previous.consumer.unsubscribe();
        }
        info!(topic, group = %group, "Subscribed to Kafka topic");
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        let mut state = self.state.read().clone();
        if self.closed.load(Ordering::Acquire) || self.producer.read().is_none() {
            state.is_connected = false;
        }
        state
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let dropped = self.stop_consumers().await;
        self.producer.write().take();

        let producer: FutureProducer = match producer_config(&self.config).create() {
            Ok(producer) => producer,
            Err(e) => {
                let error = broker(e);
                self.state.write().last_error = Some(error.to_string());
                return Err(error);
            }
        };
        *self.producer.write() = Some(producer);

        let now = Utc::now();
        let mut state = self.state.write();
        state.is_connected = true;
        state.last_connected_time = Some(now);
        state.last_reconnect_time = Some(now);
        state.reconnect_count += 1;
        state.last_error = None;
        info!(dropped, reconnects = state.reconnect_count, "Kafka clients recreated");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_consumers().await;
        let producer = self.producer.write().take();
        if let Some(producer) = producer {
            let timeout = self.config.request_timeout;
            let flushed =
                tokio::task::spawn_blocking(move || rdkafka::producer::Producer::flush(&producer, timeout))
                    .await;
            match flushed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Kafka flush on close failed"),
                Err(e) => warn!(error = %e, "Kafka flush task failed"),
            }
        }
        self.state.write().is_connected = false;
        info!("Kafka transport closed");
        Ok(())
    }

    fn persistent_by_default(&self) -> bool {
        true
    }

    async fn describe_topic(&self, topic: &str) -> Result<Option<TopicOptions>, TransportError> {
        let admin = self.admin.clone();
        let name = topic.to_string();
        let timeout = self.config.request_timeout;
        let layout = tokio::task::spawn_blocking(move || {
            let metadata = admin
                .inner()
                .fetch_metadata(Some(&name), timeout)
                .map_err(broker)?;
            let Some(found) = metadata.topics().iter().find(|t| t.name() == name) else {
                return Ok(None);
            };
            if found.error().is_some() || found.partitions().is_empty() {
                return Ok(None);
            }
            let partitions = u32::try_from(found.partitions().len()).unwrap_or(u32::MAX);
            let replicas = found
                .partitions()
                .first()
                .map_or(1, |p| u32::try_from(p.replicas().len()).unwrap_or(1));
            Ok::<_, TransportError>(Some((partitions, replicas)))
        })
        .await
        .map_err(broker)??;

        let Some((partitions, replication_factor)) = layout else {
            return Ok(None);
        };

        let described = self
            .admin
            .describe_configs(&[ResourceSpecifier::Topic(topic)], &self.admin_options())
            .await
            .map_err(broker)?;
        let mut options = TopicOptions {
            persistence_mode: PersistenceMode::Persistent,
            partitions,
            replication_factor,
            ..TopicOptions::default()
        };
        if let Some(Ok(resource)) = described.into_iter().next() {
            let value = |key: &str| resource.get(key).and_then(|entry| entry.value.clone());
            if let Some(ms) = value("retention.ms").and_then(|v| v.parse::<i64>().ok()) {
                options.retention_time = u64::try_from(ms).map_or(Duration::ZERO, Duration::from_millis);
            }
            if let Some(bytes) = value("retention.bytes").and_then(|v| v.parse::<i64>().ok()) {
                options.max_size = u64::try_from(bytes).unwrap_or(0);
            }
            if let Some(codec) = value("compression.type") {
                options.compression = compression_from(&codec);
            }
        }
        // Kafka has no per-topic message count limit.
        options.max_messages = 0;
        Ok(Some(options))
    }

    async fn create_topic(&self, topic: &str, options: &TopicOptions) -> Result<(), TransportError> {
        let retention = retention_ms(options);
        let bytes = retention_bytes(options);
        let new_topic = NewTopic::new(
            topic,
            i32::try_from(options.partitions.max(1)).unwrap_or(i32::MAX),
            TopicReplication::Fixed(i32::try_from(options.replication_factor.max(1)).unwrap_or(1)),
        )
        .set("retention.ms", &retention)
        .set("retention.bytes", &bytes)
        .set("compression.type", compression_setting(options.compression));

        let results = self
            .admin
            .create_topics(&[new_topic], &self.admin_options())
            .await
            .map_err(broker)?;
        for result in results {
            result.map_err(|(name, code)| broker(format!("create topic {name}: {code}")))?;
        }
        Ok(())
    }

    async fn update_topic(&self, topic: &str, options: &TopicOptions) -> Result<(), TransportError> {
        let retention = retention_ms(options);
        let bytes = retention_bytes(options);
        let alter = AlterConfig::new(ResourceSpecifier::Topic(topic))
            .set("retention.ms", &retention)
            .set("retention.bytes", &bytes)
            .set("compression.type", compression_setting(options.compression));
        let results = self
            .admin
            .alter_configs(&[alter], &self.admin_options())
            .await
            .map_err(broker)?;
        for result in results {
            result.map_err(|(_, code)| broker(format!("alter topic {topic}: {code}")))?;
        }

        if let Some(current) = self.describe_topic(topic).await? {
            if options.partitions > current.partitions {
                let total = usize::try_from(options.partitions).unwrap_or(usize::MAX);
                let results = self
                    .admin
                    .create_partitions(&[NewPartitions::new(topic, total)], &self.admin_options())
                    .await
                    .map_err(broker)?;
                for result in results {
                    result.map_err(|(_, code)| broker(format!("add partitions to {topic}: {code}")))?;
                }
                info!(topic, partitions = options.partitions, "Kafka partitions increased");
            }
        }
        Ok(())
    }

    async fn consumer_lag(&self, topic: &str) -> Result<Option<LagSample>, TransportError> {
        let mut consumers: Vec<(String, Arc<StreamConsumer>)> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|((t, _), _)| t == topic)
            .map(|((_, tag), s)| (group_for(&self.config.group_id, tag), s.consumer.clone()))
            .collect();
        if consumers.is_empty() {
            return Ok(None);
        }
        consumers.sort_by(|a, b| a.0.cmp(&b.0));
        let groups: Vec<String> = consumers.iter().map(|(group, _)| group.clone()).collect();
        let name = topic.to_string();
        let timeout = self.config.request_timeout;

        let lag = tokio::task::spawn_blocking(move || {
            let mut total: i64 = 0;
            for (_, consumer) in consumers {
                let committed = consumer.committed(timeout).map_err(broker)?;
                for element in committed.elements_for_topic(&name) {
                    let (_, high) = consumer
                        .fetch_watermarks(&name, element.partition(), timeout)
                        .map_err(broker)?;
                    let position = match element.offset() {
                        Offset::Offset(offset) => offset,
                        _ => 0,
                    };
                    total = total.saturating_add((high - position).max(0));
                }
            }
            Ok::<_, TransportError>(total)
        })
        .await
        .map_err(broker)??;

        Ok(Some(LagSample {
            consumer_group: groups.join(","),
            lag_count: lag,
            lag_time: Duration::ZERO,
        }))
    }
}

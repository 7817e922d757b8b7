//! # NATS JetStream Transport
//!
//! Every topic gets its own stream (`<stream_prefix>_<TOPIC>`) capturing
//! `topic` and `topic.>`, and every subscription a durable pull consumer
//! (`<durable_prefix>-<topic>-<consumer>`) with explicit acks. A delivery is acked when
//! its completion resolves `Ok` and nak'ed otherwise, so the broker
//! redelivers up to `max_deliver` times.
//!
//! Streams known to exist are cached; publishing to an unknown topic
//! creates its stream with default options first.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer};
use async_nats::jetstream::stream::{Config as StreamConfig, StorageType};
use async_nats::jetstream::{self, AckKind};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bus_types::{
    Compression, ConnectionState, PersistenceMode, TopicOptions, TransportError, TransportKind,
};
use chrono::Utc;
use futures::{FutureExt, StreamExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{spawn_ack, Delivery, DeliveryHandler, LagSample, OutboundMessage, Transport};
use crate::config::NatsConfig;
use crate::task::BackgroundTask;

struct Connection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

/// JetStream-backed transport.
pub struct NatsTransport {
    config: NatsConfig,
    connection: RwLock<Option<Connection>>,
    streams: Mutex<HashSet<String>>,
    /// (topic, consumer) -> pull loop
    consumers: Mutex<HashMap<(String, String), BackgroundTask>>,
    state: RwLock<ConnectionState>,
    closed: AtomicBool,
}

impl NatsTransport {
    /// Connect to the configured servers.
    pub async fn connect(config: NatsConfig) -> Result<Self, TransportError> {
        let connection = open(&config).await?;
        info!(urls = ?config.urls, "Connected to NATS");
        Ok(Self {
            config,
            connection: RwLock::new(Some(connection)),
            streams: Mutex::new(HashSet::new()),
            consumers: Mutex::new(HashMap::new()),
            state: RwLock::new(ConnectionState::connected()),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn stream_name(&self, topic: &str) -> String {
        stream_name(&self.config.stream_prefix, topic)
    }

    #[must_use]
    pub fn durable_name(&self, topic: &str, consumer: &str) -> String {
        durable_name(&self.config.durable_prefix, topic, consumer)
    }

    fn jetstream(&self) -> Result<jetstream::Context, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.connection
            .read()
            .as_ref()
            .map(|c| c.jetstream.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn record_error(&self, error: &TransportError) {
        self.state.write().last_error = Some(error.to_string());
    }

    async fn stream_exists(&self, name: &str) -> Result<bool, TransportError> {
        let js = self.jetstream()?;
        let mut names = js.stream_names();
        while let Some(existing) = names.try_next().await.map_err(broker)? {
            if existing == name {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn ensure_stream(&self, topic: &str) -> Result<String, TransportError> {
        let name = self.stream_name(topic);
        if self.streams.lock().contains(&name) {
            return Ok(name);
        }
        if !self.stream_exists(&name).await? {
            let config = stream_config(&name, topic, &TopicOptions::persistent());
            self.jetstream()?
                .create_stream(config)
                .await
                .map_err(broker)?;
            info!(stream = %name, topic, "Created JetStream stream");
        }
        self.streams.lock().insert(name.clone());
        Ok(name)
    }

    async fn stop_consumers(&self) -> usize {
        let consumers: Vec<BackgroundTask> = self.consumers.lock().drain().map(|(_, t)| t).collect();
        let count = consumers.len();
        for consumer in consumers {
            consumer.stop().await;
        }
        count
    }
}

async fn open(config: &NatsConfig) -> Result<Connection, TransportError> {
    let client = async_nats::ConnectOptions::new()
        .name(&config.connection_name)
        .connection_timeout(config.connect_timeout)
        .connect(config.urls.join(",").as_str())
        .await
        .map_err(broker)?;
    let jetstream = jetstream::new(client.clone());
    Ok(Connection { client, jetstream })
}

fn broker(error: impl std::fmt::Display) -> TransportError {
    TransportError::Broker(error.to_string())
}

/// `EVENTBUS` + `orders.created` -> `EVENTBUS_ORDERS_CREATED`
fn stream_name(prefix: &str, topic: &str) -> String {
    let suffix: String = topic
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{prefix}_{suffix}")
}

/// Durable names may not contain `.`, `*` or `>`.
fn durable_name(prefix: &str, topic: &str, consumer: &str) -> String {
    let clean = |s: &str| s.replace('.', "_").replace('*', "wildcard").replace('>', "all");
    format!("{prefix}-{}-{}", clean(topic), clean(consumer))
}

fn stream_config(name: &str, topic: &str, options: &TopicOptions) -> StreamConfig {
    StreamConfig {
        name: name.to_string(),
        subjects: vec![topic.to_string(), format!("{topic}.>")],
        max_age: options.retention_time,
        max_bytes: limit(options.max_size),
        max_messages: limit(options.max_messages),
        num_replicas: usize::try_from(options.replication_factor.max(1)).unwrap_or(1),
        storage: if options.persistence_mode == PersistenceMode::Ephemeral {
            StorageType::Memory
        } else {
            StorageType::File
        },
        description: (!options.description.is_empty()).then(|| options.description.clone()),
        ..StreamConfig::default()
    }
}

/// JetStream uses -1 for unlimited.
fn limit(value: u64) -> i64 {
    if value == 0 {
        -1
    } else {
        i64::try_from(value).unwrap_or(i64::MAX)
    }
}

fn options_from(config: &StreamConfig) -> TopicOptions {
    TopicOptions {
        persistence_mode: match config.storage {
            StorageType::Memory => PersistenceMode::Ephemeral,
            StorageType::File => PersistenceMode::Persistent,
        },
        retention_time: config.max_age,
        max_size: u64::try_from(config.max_bytes).unwrap_or(0),
        max_messages: u64::try_from(config.max_messages).unwrap_or(0),
        partitions: 1,
        replication_factor: u32::try_from(config.num_replicas).unwrap_or(1),
        compression: Compression::None,
        description: config.description.clone().unwrap_or_default(),
    }
}

/// First value of every header. Multi-valued headers keep only the first.
fn headers_from(map: Option<&HeaderMap>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(map) = map {
        for (name, values) in map.iter() {
            if let Some(value) = values.first() {
                headers.insert(name.to_string(), value.to_string());
            }
        }
    }
    headers
}

fn delivery_from(topic: &str, message: &jetstream::Message) -> Delivery {
    Delivery {
        topic: topic.to_string(),
        payload: message.payload.to_vec(),
        headers: headers_from(message.headers.as_ref()),
        key: None,
        subject: Some(message.subject.to_string()),
    }
}

async fn consume(
    topic: String,
    consumer: PullConsumer,
    handler: DeliveryHandler,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let mut messages = match consumer.messages().await {
        Ok(messages) => messages,
        Err(e) => {
            warn!(topic = %topic, error = %e, "Failed to open JetStream message stream");
            return;
        }
    };

    loop {
        let next = tokio::select! {
            next = messages.next() => next,
            _ = stop.changed() => break,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(topic = %topic, error = %e, "JetStream pull error");
                continue;
            }
            None => break,
        };

        let completion = handler(delivery_from(&topic, &message)).await;
        let topic = topic.clone();
        spawn_ack(completion, move |result| {
            async move {
                let acked = match result {
                    Ok(()) => message.ack().await,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Handler failed, requesting redelivery");
                        message.ack_with(AckKind::Nak(None)).await
                    }
                };
                if let Err(e) = acked {
                    warn!(topic = %topic, error = %e, "JetStream ack failed");
                }
            }
            .boxed()
        });
    }
    debug!(topic = %topic, "JetStream consumer exited");
}

#[async_trait]
impl Transport for NatsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Nats
    }

    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), TransportError> {
        self.ensure_stream(topic).await?;
        let js = self.jetstream()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &message.headers {
            headers.insert(name.as_str(), value.as_str());
        }

        let ack = js
            .publish_with_headers(topic.to_string(), headers, message.payload.into())
            .await
            .map_err(broker);
        let result = match ack {
            Ok(pending) => pending.await.map(|_| ()).map_err(broker),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    async fn subscribe(
        &self,
        topic: &str,
        consumer: &str,
        handler: DeliveryHandler,
    ) -> Result<(), TransportError> {
        let name = self.ensure_stream(topic).await?;
        let durable = self.durable_name(topic, consumer);
        let subscribe_error = |e: &dyn std::fmt::Display| TransportError::Subscribe {
            topic: topic.to_string(),
            reason: e.to_string(),
        };

        let stream = self
            .jetstream()?
            .get_stream(&name)
            .await
            .map_err(|e| subscribe_error(&e))?;
        let pull_consumer: PullConsumer = stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_deliver: self.config.max_deliver,
                    max_ack_pending: self.config.max_ack_pending,
                    deliver_policy: DeliverPolicy::All,
                    ..pull::Config::default()
                },
            )
            .await
            .map_err(|e| subscribe_error(&e))?;

        let owned_topic = topic.to_string();
        let task = BackgroundTask::spawn("nats_consumer", move |stop| {
            consume(owned_topic, pull_consumer, handler, stop)
        });
        let previous = self
            .consumers
            .lock()
            .insert((topic.to_string(), consumer.to_string()), task);
        if let Some(previous) = previous {
            warn!(topic, consumer, "Replacing existing JetStream consumer");
            tokio::spawn(previous.stop());
        }
        info!(topic, durable = %durable, "Subscribed to JetStream");
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        let mut state = self.state.read().clone();
        let live = self
            .connection
            .read()
            .as_ref()
            .is_some_and(|c| c.client.connection_state() == async_nats::connection::State::Connected);
        state.is_connected = live && !self.closed.load(Ordering::Acquire);
        state
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let dropped = self.stop_consumers().await;
        self.connection.write().take();
        self.streams.lock().clear();

        let connection = match open(&self.config).await {
            Ok(connection) => connection,
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };
        *self.connection.write() = Some(connection);

        let now = Utc::now();
        let mut state = self.state.write();
        state.last_connected_time = Some(now);
        state.last_reconnect_time = Some(now);
        state.reconnect_count += 1;
        state.last_error = None;
        info!(dropped, reconnects = state.reconnect_count, "Reconnected to NATS");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_consumers().await;
        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.client.flush().await {
                warn!(error = %e, "NATS flush on close failed");
            }
        }
        info!("NATS transport closed");
        Ok(())
    }

    fn persistent_by_default(&self) -> bool {
        true
    }

    async fn describe_topic(&self, topic: &str) -> Result<Option<TopicOptions>, TransportError> {
        let name = self.stream_name(topic);
        if !self.stream_exists(&name).await? {
            return Ok(None);
        }
        let mut stream = self.jetstream()?.get_stream(&name).await.map_err(broker)?;
        let info = stream.info().await.map_err(broker)?;
        Ok(Some(options_from(&info.config)))
    }

    async fn create_topic(&self, topic: &str, options: &TopicOptions) -> Result<(), TransportError> {
        let name = self.stream_name(topic);
        self.jetstream()?
            .create_stream(stream_config(&name, topic, options))
            .await
            .map_err(broker)?;
        self.streams.lock().insert(name);
        Ok(())
    }

    async fn update_topic(&self, topic: &str, options: &TopicOptions) -> Result<(), TransportError> {
        let name = self.stream_name(topic);
        let config = stream_config(&name, topic, options);
        self.jetstream()?
            .update_stream(&config)
            .await
            .map_err(broker)?;
        Ok(())
    }

    async fn consumer_lag(&self, topic: &str) -> Result<Option<LagSample>, TransportError> {
        let mut tags: Vec<String> = self
            .consumers
            .lock()
            .keys()
            .filter(|(t, _)| t == topic)
            .map(|(_, consumer)| consumer.clone())
            .collect();
        if tags.is_empty() {
            return Ok(None);
        }
        tags.sort();

        let stream = self
            .jetstream()?
            .get_stream(self.stream_name(topic))
            .await
            .map_err(broker)?;
        let mut pending: u64 = 0;
        let mut durables = Vec::with_capacity(tags.len());
        for tag in tags {
            let durable = self.durable_name(topic, &tag);
            let mut consumer: PullConsumer = stream.get_consumer(&durable).await.map_err(broker)?;
            let info = consumer.info().await.map_err(broker)?;
            pending = pending
                .saturating_add(info.num_pending)
                .saturating_add(info.num_ack_pending as u64);
            durables.push(durable);
        }
        Ok(Some(LagSample {
            consumer_group: durables.join(","),
            lag_count: i64::try_from(pending).unwrap_or(i64::MAX),
            lag_time: Duration::ZERO,
        }))
    }
}

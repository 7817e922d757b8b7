//! Event bus configuration from defaults and environment variables.

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use bus_types::{ConfigError, TopicConfigStrategy, TopicOptions, TransportKind};
use serde::{Deserialize, Serialize};

use crate::backlog::{PublisherBacklogConfig, SubscriberBacklogConfig};
use crate::extract::SubjectPattern;
use crate::health::HealthCheckConfig;
use crate::keyed_pool::KeyedWorkerPoolConfig;
use crate::rate_limit::RateLimitConfig;
use crate::reconnect::ReconnectConfig;
use crate::topic_config::TopicConfigManagerConfig;
use crate::transport::MemoryTransportConfig;

/// NATS JetStream connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub urls: Vec<String>,
    pub connection_name: String,
    /// Streams are named `<prefix>_<TOPIC>`.
    pub stream_prefix: String,
    /// Durable consumers are named `<prefix>-<topic>-<consumer>`.
    pub durable_prefix: String,
    #[serde(with = "bus_types::serde_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "bus_types::serde_ms")]
    pub ack_wait: Duration,
    /// Redeliveries before the broker gives up on a message.
    pub max_deliver: i64,
    pub max_ack_pending: i64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://127.0.0.1:4222".to_string()],
            connection_name: "event-bus".to_string(),
            stream_prefix: "EVENTBUS".to_string(),
            durable_prefix: "event-bus".to_string(),
            connect_timeout: Duration::from_secs(10),
            ack_wait: Duration::from_secs(30),
            max_deliver: 3,
            max_ack_pending: 1000,
        }
    }
}

/// Kafka client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub client_id: String,
    pub group_id: String,
    pub enable_idempotence: bool,
    /// `earliest` or `latest`.
    pub auto_offset_reset: String,
    #[serde(with = "bus_types::serde_ms")]
    pub session_timeout: Duration,
    #[serde(with = "bus_types::serde_ms")]
    pub request_timeout: Duration,
    /// Redeliveries of a failed offset before it is skipped.
    pub max_redeliveries: u32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "event-bus".to_string(),
            group_id: "event-bus-group".to_string(),
            enable_idempotence: true,
            auto_offset_reset: "earliest".to_string(),
            session_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_redeliveries: 3,
        }
    }
}

/// Everything needed to build an [`EventBus`](crate::EventBus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub transport: TransportKind,
    /// Reported as the heartbeat source.
    pub service_name: String,
    pub worker_pool: KeyedWorkerPoolConfig,
    pub subject_pattern: SubjectPattern,
    pub health_check: HealthCheckConfig,
    pub reconnect: ReconnectConfig,
    pub publisher_backlog: PublisherBacklogConfig,
    pub subscriber_backlog: SubscriberBacklogConfig,
    pub topic_config: TopicConfigManagerConfig,
    pub rate_limit: RateLimitConfig,
    /// Topics configured by `start()`.
    pub topics: BTreeMap<String, TopicOptions>,
    #[serde(with = "bus_types::serde_ms")]
    pub default_publish_timeout: Duration,
    pub memory: MemoryTransportConfig,
    pub nats: NatsConfig,
    pub kafka: KafkaConfig,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Memory,
            service_name: "event-bus".to_string(),
            worker_pool: KeyedWorkerPoolConfig::default(),
            subject_pattern: SubjectPattern::default(),
            health_check: HealthCheckConfig::default(),
            reconnect: ReconnectConfig::default(),
            publisher_backlog: PublisherBacklogConfig::default(),
            subscriber_backlog: SubscriberBacklogConfig::default(),
            topic_config: TopicConfigManagerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            topics: BTreeMap::new(),
            default_publish_timeout: Duration::from_secs(30),
            memory: MemoryTransportConfig::default(),
            nats: NatsConfig::default(),
            kafka: KafkaConfig::default(),
        }
    }
}

impl EventBusConfig {
    /// Defaults overlaid with `BUS_*` environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BUS_TRANSPORT`: `memory`, `nats` or `kafka` (default: memory)
    /// - `BUS_SERVICE_NAME`: heartbeat source (default: event-bus)
    /// - `BUS_WORKER_COUNT` / `BUS_QUEUE_SIZE`: keyed pool sizing (default: 256 / 1000)
    /// - `BUS_ENQUEUE_TIMEOUT_MS`: fail instead of blocking on a full worker queue
    /// - `BUS_HEALTH_ENABLED`: start health checks with the bus (default: false)
    /// - `BUS_HEALTH_INTERVAL_MS` / `BUS_HEALTH_TIMEOUT_MS`: heartbeat cadence and bound
    /// - `BUS_HEALTH_TOPIC`: heartbeat topic override
    /// - `BUS_RECONNECT_MAX_ATTEMPTS`: attempts before giving up (default: 10)
    /// - `BUS_TOPIC_STRATEGY`: `create_only`, `create_or_update`, `validate_only`, `skip`
    /// - `BUS_PUBLISH_TIMEOUT_MS`: default publish timeout (default: 30000)
    /// - `BUS_RATE_LIMIT_ENABLED`: pace handler dispatch (default: false)
    /// - `BUS_RATE_LIMIT_PER_SECOND` / `BUS_RATE_LIMIT_BURST`: bucket refill and size (default: 1000 / 100)
    /// - `BUS_NATS_URL`: comma-separated server list
    /// - `BUS_KAFKA_BROKERS`: comma-separated broker list
    /// - `BUS_KAFKA_GROUP_ID`: consumer group
    ///
    /// Unparseable values fall back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let flag = |key: &str| {
            lookup(key).map(|v| {
                let v = v.trim().to_lowercase();
                v == "true" || v == "1"
            })
        };
        let list = |key: &str| {
            lookup(key).map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
        };

        let mut config = Self::default();
        if let Some(kind) = lookup("BUS_TRANSPORT").and_then(|v| v.parse().ok()) {
            config.transport = kind;
        }
        if let Some(name) = lookup("BUS_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Some(n) = parse("BUS_WORKER_COUNT").and_then(|n| usize::try_from(n).ok()) {
            config.worker_pool.worker_count = n;
        }
        if let Some(n) = parse("BUS_QUEUE_SIZE").and_then(|n| usize::try_from(n).ok()) {
            config.worker_pool.queue_size = n;
        }
        if let Some(ms) = parse("BUS_ENQUEUE_TIMEOUT_MS") {
            config.worker_pool.enqueue_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(enabled) = flag("BUS_HEALTH_ENABLED") {
            config.health_check.enabled = enabled;
        }
        if let Some(ms) = parse("BUS_HEALTH_INTERVAL_MS") {
            config.health_check.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse("BUS_HEALTH_TIMEOUT_MS") {
            config.health_check.timeout = Duration::from_millis(ms);
        }
        if let Some(topic) = lookup("BUS_HEALTH_TOPIC") {
            config.health_check.topic = Some(topic);
        }
        if let Some(n) = parse("BUS_RECONNECT_MAX_ATTEMPTS").and_then(|n| u32::try_from(n).ok()) {
            config.reconnect.max_attempts = n;
        }
        if let Some(strategy) = lookup("BUS_TOPIC_STRATEGY").and_then(|v| v.parse().ok()) {
            config.topic_config.strategy = strategy;
        }
        if let Some(ms) = parse("BUS_PUBLISH_TIMEOUT_MS") {
            config.default_publish_timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = flag("BUS_RATE_LIMIT_ENABLED") {
            config.rate_limit.enabled = enabled;
        }
        if let Some(rate) = lookup("BUS_RATE_LIMIT_PER_SECOND").and_then(|v| v.trim().parse::<f64>().ok()) {
            config.rate_limit.rate_per_second = rate;
        }
        if let Some(n) = parse("BUS_RATE_LIMIT_BURST").and_then(|n| u32::try_from(n).ok()) {
            config.rate_limit.burst_size = n;
        }
        if let Some(urls) = list("BUS_NATS_URL") {
            config.nats.urls = urls;
        }
        if let Some(brokers) = list("BUS_KAFKA_BROKERS") {
            config.kafka.brokers = brokers;
        }
        if let Some(group) = lookup("BUS_KAFKA_GROUP_ID") {
            config.kafka.group_id = group;
        }
        config
    }

    /// Preset with the topic manager in `strategy` mode.
    #[must_use]
    pub fn with_topic_strategy(mut self, strategy: TopicConfigStrategy) -> Self {
        self.topic_config.strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "service_name",
                reason: "cannot be empty".into(),
            });
        }
        if self.worker_pool.worker_count == 0 {
            return Err(ConfigError::Invalid {
                field: "worker_pool.worker_count",
                reason: "must be at least 1".into(),
            });
        }
        if self.worker_pool.queue_size == 0 {
            return Err(ConfigError::Invalid {
                field: "worker_pool.queue_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.default_publish_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "default_publish_timeout",
                reason: "must be positive".into(),
            });
        }
        self.health_check.validate()?;
        self.reconnect.validate()?;
        self.publisher_backlog.validate()?;
        self.subscriber_backlog.validate()?;
        self.rate_limit.validate()?;

        match self.transport {
            TransportKind::Nats if self.nats.urls.is_empty() => Err(ConfigError::Invalid {
                field: "nats.urls",
                reason: "at least one server is required".into(),
            }),
            TransportKind::Kafka if self.kafka.brokers.is_empty() => Err(ConfigError::Invalid {
                field: "kafka.brokers",
                reason: "at least one broker is required".into(),
            }),
            TransportKind::Kafka if self.kafka.group_id.trim().is_empty() => {
                Err(ConfigError::Invalid {
                    field: "kafka.group_id",
                    reason: "cannot be empty".into(),
                })
            }
            _ => Ok(()),
        }
    }
}

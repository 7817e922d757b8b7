//! # Transport Adapters
//!
//! A [`Transport`] moves opaque bytes to and from one broker. The facade
//! owns everything else: subscription bookkeeping, ordering, replay.
//!
//! ## Delivery Contract
//!
//! For each subscription the transport hands deliveries to the
//! [`DeliveryHandler`] one at a time, in broker order, awaiting the
//! dispatch future before the next delivery. The dispatch future yields a
//! [`Completion`]; the transport acknowledges the message when the
//! completion resolves `Ok` and negatively acknowledges (or leaves the
//! offset uncommitted) on `Err`. Completions may resolve out of order.
//!
//! ## Consumers
//!
//! A subscription is identified by its topic and a consumer tag. Adapters
//! derive durable consumer and group names from both, so two consumers of
//! one topic (raw bytes and envelopes, say) each get their own broker-side
//! cursor. Subscribing again with the same pair replaces the earlier one.
//!
//! ## Reconnect Contract
//!
//! After [`Transport::reconnect`] returns `Ok`, the adapter holds no
//! subscriptions; the facade re-issues every subscription it recorded.
//!
//! | Adapter | Routing | Ack | Feature |
//! |---------|---------|-----|---------|
//! | [`MemoryTransport`] | topic | none | always |
//! | `NatsTransport` | subject | per message, explicit | `nats` |
//! | `KafkaTransport` | partition key | offset commit | `kafka` |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus_types::{ConnectionState, NoAggregateId, TopicOptions, TransportError, TransportKind};
use futures::future::BoxFuture;

use crate::extract::{extract_aggregate_id, SubjectPattern};
pub use crate::keyed_pool::Completion;

pub mod memory;
#[cfg_attr(not(feature = "kafka"), allow(dead_code))]
pub(crate) mod offsets;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "nats")]
pub mod nats;

pub use memory::{MemoryTransport, MemoryTransportConfig};
#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
#[cfg(feature = "nats")]
pub use nats::NatsTransport;

/// Message handed to a transport for publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    /// Broker routing key (Kafka partition key).
    pub key: Option<String>,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }
}

/// Message received from a broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub key: Option<String>,
    /// Full broker subject when it differs from the subscribed topic.
    pub subject: Option<String>,
}

impl Delivery {
    /// Aggregate id by the standard priority order.
    pub fn aggregate_id(&self, pattern: SubjectPattern) -> Result<String, NoAggregateId> {
        extract_aggregate_id(
            &self.payload,
            &self.headers,
            self.key.as_deref(),
            Some(self.subject.as_deref().unwrap_or(&self.topic)),
            pattern,
        )
    }
}

/// Called by a transport once per delivery, in broker order.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, Completion> + Send + Sync>;

/// Consumer lag reported by a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagSample {
    pub consumer_group: String,
    pub lag_count: i64,
    pub lag_time: Duration,
}

/// Raw publish/subscribe against one broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Safe for concurrent callers.
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), TransportError>;

    /// Start consuming `topic` as `consumer`.
    async fn subscribe(
        &self,
        topic: &str,
        consumer: &str,
        handler: DeliveryHandler,
    ) -> Result<(), TransportError>;

    fn connection_state(&self) -> ConnectionState;

    /// Tear down and re-establish the connection, dropping all subscriptions.
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Release the connection. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Persistence used for topics configured with `PersistenceMode::Auto`.
    fn persistent_by_default(&self) -> bool {
        false
    }

    /// Current broker-side config, `None` if the topic does not exist.
    async fn describe_topic(&self, topic: &str) -> Result<Option<TopicOptions>, TransportError>;

    async fn create_topic(&self, topic: &str, options: &TopicOptions) -> Result<(), TransportError>;

    async fn update_topic(&self, topic: &str, options: &TopicOptions) -> Result<(), TransportError>;

    /// Lag of this process's consumers on `topic`, summed, `None` if unknown.
    async fn consumer_lag(&self, _topic: &str) -> Result<Option<LagSample>, TransportError> {
        Ok(None)
    }
}

/// Run a delivery's completion and report the outcome to `ack`.
pub(crate) fn spawn_ack<F>(completion: Completion, ack: F)
where
    F: FnOnce(anyhow::Result<()>) -> BoxFuture<'static, ()> + Send + 'static,
{
    tokio::spawn(async move {
        let result = completion.await;
        ack(result).await;
    });
}

//! # Error Types
//!
//! One enum per concern, folded into [`BusError`] at the facade.
//!
//! | Category | Type | Retried? |
//! |----------|------|----------|
//! | Validation | [`EnvelopeError`], [`NoAggregateId`] | never |
//! | Transport | [`TransportError`] | by the reconnect loop |
//! | Ordering engine | [`PoolError`] | no |
//! | Configuration | [`TopicConfigError`], [`ConfigError`] | no |

use std::time::Duration;

use thiserror::Error;

/// Envelope validation and codec failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// A required string field is empty after trimming.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Event versions start at 1.
    #[error("Invalid event version {0}: must be >= 1")]
    InvalidVersion(i64),

    /// Aggregate id too long or containing characters outside the allowed set.
    #[error("Invalid aggregate id: {0}")]
    InvalidAggregateId(String),

    /// Payload empty or not well-formed JSON.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Malformed JSON or missing fields while decoding.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Serialization failed.
    #[error("Encode error: {0}")]
    Encode(String),
}

/// None of the extraction sources yielded a usable aggregate id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("aggregate_id not found in envelope, headers, transport key or subject")]
pub struct NoAggregateId;

/// Failures talking to a broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is down.
    #[error("Transport not connected")]
    NotConnected,

    /// The transport was closed and cannot be used again.
    #[error("Transport closed")]
    Closed,

    /// A broker call did not complete in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Broker-reported failure.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Subscription could not be established.
    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// The adapter does not implement this operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Keyed-Worker Pool failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Worker queue stayed full for the whole enqueue timeout.
    #[error("Worker {worker} queue full after {timeout:?}")]
    QueueFull { worker: usize, timeout: Duration },

    /// The pool is closed and no longer accepts work.
    #[error("Worker pool closed")]
    Closed,

    /// Routing requires a non-empty aggregate id.
    #[error("Message has no aggregate id")]
    MissingAggregateId,

    /// The worker dropped the message without reporting a result.
    #[error("Worker {0} exited before completing the message")]
    WorkerGone(usize),
}

/// Topic configuration failures, returned synchronously from `configure_topic`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicConfigError {
    /// The strategy forbids creation and the topic does not exist.
    #[error("Topic not configured: {0}")]
    NotConfigured(String),

    /// `ValidateOnly` found differences between expected and actual config.
    #[error("Topic {topic} config mismatch: {details}")]
    Mismatch { topic: String, details: String },

    /// The field cannot change after creation.
    #[error("Topic {topic}: {field} is immutable after creation")]
    Immutable { topic: String, field: &'static str },

    /// Partition counts only grow.
    #[error("Topic {topic}: partitions may only increase ({current} -> {requested})")]
    PartitionDecrease {
        topic: String,
        current: u32,
        requested: u32,
    },

    /// Topic name is empty.
    #[error("Topic name cannot be empty")]
    EmptyTopic,

    /// Control-plane call failed.
    #[error("Topic control plane error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field holds an unusable value.
    #[error("Invalid config {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level error returned by the event bus facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    AggregateId(#[from] NoAggregateId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    TopicConfig(#[from] TopicConfigError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The bus was closed.
    #[error("Event bus closed")]
    Closed,

    /// The topic already has a subscription of this kind.
    #[error("Topic {0} is already subscribed")]
    AlreadySubscribed(String),

    /// A background loop was started twice.
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Reconnect gave up.
    #[error("Reconnect failed after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// Publish did not complete within the caller's timeout.
    #[error("Publish to {topic} timed out after {timeout:?}")]
    PublishTimeout { topic: String, timeout: Duration },
}

//! # Event Bus - Ordered Publish/Subscribe Over Any Broker
//!
//! One facade, three transports, and a delivery engine that keeps events
//! for the same aggregate in order while different aggregates run in
//! parallel.
//!
//! ## Ordering Model
//!
//! ```text
//!   broker ──► Transport ──► Envelope ──► aggregate_id ──► FNV-1a % N
//!                                                             │
//!              ┌──────────┬──────────┬──────────┬─────────────┘
//!              ▼          ▼          ▼          ▼
//!          worker 0   worker 1    ...      worker N-1     (FIFO each)
//! ```
//!
//! - **Per-aggregate FIFO:** one aggregate always maps to one worker.
//! - **Ack after handling:** a delivery is acknowledged only once its
//!   handler has finished.
//! - **Replay on reconnect:** the facade records every subscription and
//!   re-issues it after the transport reconnects.
//!
//! ## Transports
//!
//! | Kind | Feature | Notes |
//! |------|---------|-------|
//! | Memory | always | in-process, tests and single-node use |
//! | NATS JetStream | `nats` | durable consumers, explicit ack |
//! | Kafka | `kafka` | keyed partitions, manual offset commit |

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod backlog;
pub mod bus;
pub mod callbacks;
pub mod config;
pub mod extract;
pub mod health;
pub mod keyed_pool;
pub mod rate_limit;
pub mod reconnect;
mod task;
pub mod topic_config;
pub mod transport;

pub use bus_types;

// Re-export main types
pub use backlog::{
    LagSource, PublisherBacklogConfig, PublisherBacklogDetector, SeverityPolicy,
    SubscriberBacklogConfig, SubscriberBacklogDetector,
};
pub use bus::{EventBus, SubscriptionKind};
pub use bus_types::{BusError, Envelope, PublishOptions, PublishResult, TransportKind};
pub use config::{EventBusConfig, KafkaConfig, NatsConfig};
pub use extract::{extract_aggregate_id, SubjectPattern, AGGREGATE_ID_HEADER};
pub use health::{
    HealthCheckConfig, HealthCheckSubscriber, HealthChecker, HealthSubscriberConfig,
    HeartbeatMessage,
};
pub use keyed_pool::{fnv1a_32, worker_index, KeyedWorkerPool, KeyedWorkerPoolConfig};
pub use rate_limit::{AdaptiveRateLimitConfig, RateLimitConfig, RateLimiter, RateLimiterStats};
pub use reconnect::{ReconnectConfig, ReconnectController};
pub use topic_config::{TopicConfigManager, TopicConfigManagerConfig};
pub use transport::{
    Delivery, DeliveryHandler, MemoryTransport, MemoryTransportConfig, OutboundMessage, Transport,
};

//! # Bus Types Crate
//!
//! Shared vocabulary for the ordered event bus: the `Envelope` wire format,
//! error taxonomy, topic options and the state snapshots handed to callers.
//!
//! ## Design Principles
//!
//! - **Envelope is the unit of ordered work**: every ordered delivery carries
//!   an `aggregate_id` and a monotonically increasing `event_version`.
//! - **Snapshots are values**: health, connection and backlog states are
//!   plain cloneable structs. Nothing in this crate holds a lock.
//! - **Validation before the network**: `Envelope::validate` runs before any
//!   byte reaches a transport.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod envelope;
pub mod errors;
pub mod options;
pub mod serde_ms;
pub mod status;
pub mod topic;

pub use envelope::{is_valid_aggregate_id, Envelope, MAX_AGGREGATE_ID_LEN};
pub use errors::*;
pub use options::{PublishOptions, PublishResult, RetryPolicy};
pub use status::*;
pub use topic::{
    Compression, PersistenceMode, TopicConfigMismatch, TopicConfigStrategy, TopicOptions,
    TopicSyncAction, TopicSyncResult,
};

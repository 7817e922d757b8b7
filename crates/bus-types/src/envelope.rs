//! # Ordered-Event `Envelope`
//!
//! The unit of ordered, attributable work. All events for one `aggregate_id`
//! are processed in `event_version` order by the Keyed-Worker Pool.
//!
//! ## Wire Format
//!
//! ```json
//! {
//!   "event_id": "order-42:OrderCreated:1:1718000000000000000",
//!   "aggregate_id": "order-42",
//!   "event_type": "OrderCreated",
//!   "event_version": 1,
//!   "timestamp": "2024-06-10T06:13:20Z",
//!   "trace_id": "optional",
//!   "correlation_id": "optional",
//!   "tenant_id": "optional",
//!   "payload": {"any": "json"}
//! }
//! ```
//!
//! Field order is fixed, so encoding is deterministic. The payload bytes are
//! embedded verbatim as a JSON value and are never interpreted beyond a
//! well-formedness check.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EnvelopeError;

/// Longest accepted aggregate id, in characters.
pub const MAX_AGGREGATE_ID_LEN: usize = 256;

/// Ordered-event wrapper carrying aggregate identity, version and payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique event id.
    pub event_id: String,

    /// Ordering domain. All events of one aggregate are handled in version order.
    pub aggregate_id: String,

    /// Application-defined discriminator.
    pub event_type: String,

    /// Starts at 1 and increases per aggregate.
    pub event_version: i64,

    /// Creation time, used for end-to-end latency.
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Opaque JSON bytes.
    #[serde(with = "raw_payload")]
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create an envelope whose `event_id` is derived as
    /// `AggregateID:EventType:EventVersion:nanoTimestamp`.
    #[must_use]
    pub fn new(
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        event_version: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let aggregate_id = aggregate_id.into();
        let event_type = event_type.into();
        let timestamp = Utc::now();
        let event_id = derive_event_id(&aggregate_id, &event_type, event_version, timestamp);
        Self {
            event_id,
            aggregate_id,
            event_type,
            event_version,
            timestamp,
            trace_id: None,
            correlation_id: None,
            tenant_id: None,
            payload: payload.into(),
        }
    }

    /// Create an envelope with a caller-supplied `event_id` (outbox rows).
    #[must_use]
    pub fn with_event_id(
        event_id: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        event_version: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let mut envelope = Self::new(aggregate_id, event_type, event_version, payload);
        envelope.event_id = event_id.into();
        envelope
    }

    /// Create an envelope with a time-ordered UUIDv7 `event_id`.
    #[must_use]
    pub fn new_with_auto_id(
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        event_version: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self::with_event_id(
            Uuid::now_v7().to_string(),
            aggregate_id,
            event_type,
            event_version,
            payload,
        )
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Check the envelope before it is serialized.
    ///
    /// # Errors
    ///
    /// - `MissingField` for an empty `event_id`, `aggregate_id` or `event_type`
    /// - `InvalidVersion` when `event_version < 1`
    /// - `InvalidPayload` for an empty or non-JSON payload
    /// - `InvalidAggregateId` for ids over 256 chars or outside `[A-Za-z0-9:_\-./]`
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.event_id.trim().is_empty() {
            return Err(EnvelopeError::MissingField("event_id"));
        }
        if self.aggregate_id.trim().is_empty() {
            return Err(EnvelopeError::MissingField("aggregate_id"));
        }
        if self.event_type.trim().is_empty() {
            return Err(EnvelopeError::MissingField("event_type"));
        }
        if self.event_version < 1 {
            return Err(EnvelopeError::InvalidVersion(self.event_version));
        }
        if self.payload.is_empty() {
            return Err(EnvelopeError::InvalidPayload("payload is empty".into()));
        }
        if let Err(e) = serde_json::from_slice::<serde::de::IgnoredAny>(&self.payload) {
            return Err(EnvelopeError::InvalidPayload(e.to_string()));
        }
        if !is_valid_aggregate_id(&self.aggregate_id) {
            return Err(EnvelopeError::InvalidAggregateId(self.aggregate_id.clone()));
        }
        Ok(())
    }

    /// Validate, then encode as JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        self.validate()?;
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Decode from JSON, then validate.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Decode(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Time elapsed since the envelope was created. Zero if the clock went backwards.
    #[must_use]
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// `AggregateID:EventType:EventVersion:nanoTimestamp`
#[must_use]
pub fn derive_event_id(
    aggregate_id: &str,
    event_type: &str,
    event_version: i64,
    timestamp: DateTime<Utc>,
) -> String {
    format!(
        "{}:{}:{}:{}",
        aggregate_id,
        event_type,
        event_version,
        timestamp.timestamp_nanos_opt().unwrap_or_default()
    )
}

/// Non-empty, at most [`MAX_AGGREGATE_ID_LEN`] chars, only `[A-Za-z0-9:_\-./]`.
#[must_use]
pub fn is_valid_aggregate_id(id: &str) -> bool {
    !id.is_empty()
        && id.chars().count() <= MAX_AGGREGATE_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.' | '/'))
}

/// Embeds payload bytes as a raw JSON value and reads them back verbatim.
mod raw_payload {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::value::RawValue;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let raw: &RawValue = serde_json::from_slice(bytes).map_err(S::Error::custom)?;
        raw.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw: Box<RawValue> = Deserialize::deserialize(deserializer)?;
        if raw.get().is_empty() {
            return Err(D::Error::custom("empty payload"));
        }
        Ok(raw.get().as_bytes().to_vec())
    }
}

//! Heartbeat message published on the health-check topic.

use std::collections::HashMap;
use std::time::Duration;

use bus_types::TransportKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Heartbeat topic used when the transport kind is unknown.
pub const DEFAULT_HEALTH_CHECK_TOPIC: &str = "event-bus-health-check";

/// Version stamped into every heartbeat.
pub const HEARTBEAT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Dedicated heartbeat topic per transport.
#[must_use]
pub fn health_check_topic(kind: TransportKind) -> &'static str {
    match kind {
        TransportKind::Kafka => "event-bus-kafka-health-check",
        TransportKind::Nats => "event-bus-nats-health-check",
        TransportKind::Memory => "event-bus-memory-health-check",
    }
}

/// Heartbeat decode and validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeartbeatError {
    #[error("Malformed heartbeat: {0}")]
    Malformed(String),

    #[error("Heartbeat field {0} is required")]
    MissingField(&'static str),

    #[error("Heartbeat too old: {age:?} exceeds {max_age:?}")]
    Expired { age: Duration, max_age: Duration },

    #[error("Invalid eventBusType: {0}")]
    InvalidBusType(String),
}

/// Heartbeat payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    /// `hc-<unix nanos>-<16 hex chars>`
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    /// Service that published the heartbeat.
    pub source: String,
    pub event_bus_type: String,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl HeartbeatMessage {
    #[must_use]
    pub fn new(source: impl Into<String>, kind: TransportKind) -> Self {
        let timestamp = Utc::now();
        Self {
            message_id: format!(
                "hc-{}-{:016x}",
                timestamp.timestamp_nanos_opt().unwrap_or_default(),
                rand::random::<u64>()
            ),
            timestamp,
            source: source.into(),
            event_bus_type: kind.as_str().to_string(),
            version: HEARTBEAT_VERSION.to_string(),
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, HeartbeatError> {
        serde_json::to_vec(self).map_err(|e| HeartbeatError::Malformed(e.to_string()))
    }

    /// Decode and validate against `max_age`.
    pub fn parse(bytes: &[u8], max_age: Duration) -> Result<Self, HeartbeatError> {
        let message: Self =
            serde_json::from_slice(bytes).map_err(|e| HeartbeatError::Malformed(e.to_string()))?;
        message.validate(max_age)?;
        Ok(message)
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn validate(&self, max_age: Duration) -> Result<(), HeartbeatError> {
        if self.message_id.is_empty() {
            return Err(HeartbeatError::MissingField("messageId"));
        }
        if self.source.is_empty() {
            return Err(HeartbeatError::MissingField("source"));
        }
        if self.event_bus_type.is_empty() {
            return Err(HeartbeatError::MissingField("eventBusType"));
        }
        if self.version.is_empty() {
            return Err(HeartbeatError::MissingField("version"));
        }
        let age = self.age();
        if age > max_age {
            return Err(HeartbeatError::Expired { age, max_age });
        }
        if self.event_bus_type.parse::<TransportKind>().is_err() {
            return Err(HeartbeatError::InvalidBusType(self.event_bus_type.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn test_message_id_format() {
        let msg = HeartbeatMessage::new("orders-svc", TransportKind::Nats);
        let parts: Vec<&str> = msg.message_id.split('-').collect();
        assert_eq!(parts[0], "hc");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 16);
        assert_eq!(msg.event_bus_type, "nats");
    }

    #[test]
    fn test_parse_round_trip() {
        let msg = HeartbeatMessage::new("orders-svc", TransportKind::Memory)
            .with_metadata("checkType", "periodic");
        let parsed = HeartbeatMessage::parse(&msg.to_bytes().unwrap(), TTL).unwrap();
        assert_eq!(parsed, msg);
        assert!(String::from_utf8(msg.to_bytes().unwrap())
            .unwrap()
            .contains("\"eventBusType\":\"memory\""));
    }

    #[test]
    fn test_rejects_expired_and_unknown_type() {
        let mut msg = HeartbeatMessage::new("svc", TransportKind::Kafka);
        msg.timestamp = Utc::now() - chrono::Duration::minutes(10);
        assert!(matches!(msg.validate(TTL), Err(HeartbeatError::Expired { .. })));

        let mut msg = HeartbeatMessage::new("svc", TransportKind::Kafka);
        msg.event_bus_type = "redis".into();
        assert_eq!(
            msg.validate(TTL),
            Err(HeartbeatError::InvalidBusType("redis".into()))
        );

        let mut msg = HeartbeatMessage::new("svc", TransportKind::Kafka);
        msg.source.clear();
        assert_eq!(msg.validate(TTL), Err(HeartbeatError::MissingField("source")));
    }

    #[test]
    fn test_topic_per_transport() {
        assert_eq!(health_check_topic(TransportKind::Kafka), "event-bus-kafka-health-check");
        assert_ne!(
            health_check_topic(TransportKind::Nats),
            health_check_topic(TransportKind::Memory)
        );
    }
}

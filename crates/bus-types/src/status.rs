//! # Status Snapshots
//!
//! Point-in-time values produced by the health checker, the reconnect
//! controller, the backlog detectors and the facade. Each snapshot is
//! immutable once produced; callers persist them if they need history.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Which broker backs a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Kafka,
    Nats,
    #[default]
    Memory,
}

impl TransportKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kafka => "kafka",
            Self::Nats => "nats",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" => Ok(Self::Kafka),
            "nats" => Ok(Self::Nats),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::Invalid {
                field: "transport",
                reason: format!("unknown transport '{other}'"),
            }),
        }
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Broker connection snapshot, mutated by the transport and the reconnect loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub last_connected_time: Option<DateTime<Utc>>,
    pub reconnect_count: u64,
    pub last_reconnect_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ConnectionState {
    /// A freshly established connection.
    #[must_use]
    pub fn connected() -> Self {
        Self {
            is_connected: true,
            last_connected_time: Some(Utc::now()),
            ..Self::default()
        }
    }
}

/// Reconnect controller snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectStatus {
    pub failure_count: u32,
    pub last_reconnect_time: Option<DateTime<Utc>>,
    pub is_reconnecting: bool,
    /// Attempts were exhausted. Cleared by the next successful reconnect.
    pub terminal_failed: bool,
}

// =============================================================================
// HEALTH (PUBLISHER SIDE)
// =============================================================================

/// Health checker state machine.
///
/// ```text
/// Stopped → Running → (Healthy ⇄ Degraded) → Reconnecting → Running
///                                               │
///                                               └─ attempts exhausted → Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Stopped,
    /// Started, no check completed yet.
    Running,
    Healthy,
    Degraded,
    Reconnecting,
    /// Reconnect attempts exhausted.
    Failed,
}

/// Publisher-side health snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub state: HealthState,
    pub event_bus_type: TransportKind,
    pub source: String,
}

/// Outcome of one heartbeat check, handed to health-check callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "crate::serde_ms")]
    pub duration: Duration,
    pub error: Option<String>,
    pub consecutive_failures: u32,
    pub event_bus_type: TransportKind,
    pub source: String,
}

// =============================================================================
// HEALTH (SUBSCRIBER SIDE)
// =============================================================================

/// Severity of a missed-heartbeat alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Error,
    Critical,
}

/// Raised when heartbeats stop arriving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckAlert {
    /// Always `no_messages` today.
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub source: String,
    pub topic: String,
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(with = "crate::serde_ms")]
    pub time_since_last_message: Duration,
    #[serde(with = "crate::serde_ms")]
    pub expected_interval: Duration,
    pub consecutive_misses: u32,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

/// Heartbeat observer statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSubscriberStats {
    pub start_time: Option<DateTime<Utc>>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub total_messages_received: u64,
    pub consecutive_misses: u32,
    pub total_alerts: u64,
    pub last_alert_time: Option<DateTime<Utc>>,
    pub is_healthy: bool,
    #[serde(with = "crate::serde_ms")]
    pub uptime: Duration,
}

// =============================================================================
// BACKLOG
// =============================================================================

/// Publisher backlog severity, ordered `Normal < Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum BacklogSeverity {
    #[default]
    Normal,
    Low,
    Medium,
    High,
    Critical,
}

/// Subscriber-side lag sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogState {
    pub topic: String,
    pub consumer_group: String,
    pub lag_count: i64,
    #[serde(with = "crate::serde_ms")]
    pub lag_time: Duration,
    pub has_backlog: bool,
    pub timestamp: DateTime<Utc>,
}

/// Publisher-side pressure sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherBacklogState {
    pub has_backlog: bool,
    pub queue_depth: i64,
    /// Messages per second over the last check interval.
    pub publish_rate: f64,
    #[serde(with = "crate::serde_ms")]
    pub avg_publish_latency: Duration,
    /// Largest threshold utilisation, clamped to `[0.0, 1.0]`.
    pub backlog_ratio: f64,
    pub severity: BacklogSeverity,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// FACADE METRICS
// =============================================================================

/// Facade counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMetrics {
    pub messages_published: u64,
    pub messages_consumed: u64,
    pub publish_errors: u64,
    pub consume_errors: u64,
    pub connection_errors: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub active_subscriptions: usize,
}

//! # Health Checking
//!
//! Two independent roles share one heartbeat topic per transport:
//!
//! | Role | Type | Does |
//! |------|------|------|
//! | Publisher | [`HealthChecker`] | Publishes a heartbeat every `interval`, counts failures, triggers reconnect |
//! | Subscriber | [`HealthCheckSubscriber`] | Watches the topic, counts missed heartbeats, raises alerts |
//!
//! A service normally runs the publisher; a monitoring service runs the
//! subscriber. Both can run in the same process.

mod checker;
mod message;
mod subscriber;

use std::time::Duration;

use bus_types::{AlertSeverity, ConfigError, TransportKind};
use serde::{Deserialize, Serialize};

pub use checker::{HealthChecker, Recovery};
pub use message::{
    health_check_topic, HeartbeatError, HeartbeatMessage, DEFAULT_HEALTH_CHECK_TOPIC,
    HEARTBEAT_VERSION,
};
pub use subscriber::HealthCheckSubscriber;

/// Shortest accepted heartbeat or monitor interval.
pub const MIN_HEALTH_INTERVAL: Duration = Duration::from_millis(100);

/// Heartbeat publisher and subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Start both roles together with the bus.
    pub enabled: bool,
    /// Overrides the per-transport heartbeat topic.
    pub topic: Option<String>,
    #[serde(with = "bus_types::serde_ms")]
    pub interval: Duration,
    /// Bound on a single heartbeat publish.
    #[serde(with = "bus_types::serde_ms")]
    pub timeout: Duration,
    /// Heartbeats older than this are rejected by the subscriber.
    #[serde(with = "bus_types::serde_ms")]
    pub message_ttl: Duration,
    pub subscriber: HealthSubscriberConfig,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topic: None,
            interval: Duration::from_secs(120),
            timeout: Duration::from_secs(10),
            message_ttl: Duration::from_secs(300),
            subscriber: HealthSubscriberConfig::default(),
        }
    }
}

impl HealthCheckConfig {
    /// Explicit topic, or the dedicated topic for `kind`.
    #[must_use]
    pub fn resolved_topic(&self, kind: TransportKind) -> String {
        match &self.topic {
            Some(topic) if !topic.trim().is_empty() => topic.clone(),
            _ => health_check_topic(kind).to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval < MIN_HEALTH_INTERVAL {
            return Err(ConfigError::Invalid {
                field: "health_check.interval",
                reason: format!("{:?} is below {:?}", self.interval, MIN_HEALTH_INTERVAL),
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "health_check.timeout",
                reason: "must be positive".into(),
            });
        }
        self.subscriber.validate()
    }
}

/// Missed-heartbeat monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSubscriberConfig {
    #[serde(with = "bus_types::serde_ms")]
    pub monitor_interval: Duration,
    pub warning_threshold: u32,
    pub error_threshold: u32,
    pub critical_threshold: u32,
}

impl Default for HealthSubscriberConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            warning_threshold: 3,
            error_threshold: 5,
            critical_threshold: 10,
        }
    }
}

impl HealthSubscriberConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor_interval < MIN_HEALTH_INTERVAL {
            return Err(ConfigError::Invalid {
                field: "health_check.subscriber.monitor_interval",
                reason: format!(
                    "{:?} is below {:?}",
                    self.monitor_interval, MIN_HEALTH_INTERVAL
                ),
            });
        }
        if self.warning_threshold == 0
            || self.warning_threshold > self.error_threshold
            || self.error_threshold > self.critical_threshold
        {
            return Err(ConfigError::Invalid {
                field: "health_check.subscriber.thresholds",
                reason: "need 0 < warning <= error <= critical".into(),
            });
        }
        Ok(())
    }

    /// Alert severity for `misses` consecutive missed heartbeats, or `None`
    /// below the warning threshold.
    #[must_use]
    pub fn classify(&self, misses: u32) -> Option<AlertSeverity> {
        if misses >= self.critical_threshold {
            Some(AlertSeverity::Critical)
        } else if misses >= self.error_threshold {
            Some(AlertSeverity::Error)
        } else if misses >= self.warning_threshold {
            Some(AlertSeverity::Warning)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.interval, Duration::from_secs(120));
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.message_ttl, Duration::from_secs(300));
        assert_eq!(config.subscriber.monitor_interval, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolved_topic() {
        let mut config = HealthCheckConfig::default();
        assert_eq!(
            config.resolved_topic(TransportKind::Nats),
            "event-bus-nats-health-check"
        );
        config.topic = Some("custom-hc".into());
        assert_eq!(config.resolved_topic(TransportKind::Nats), "custom-hc");
    }

    #[test]
    fn test_classify_thresholds() {
        let config = HealthSubscriberConfig::default();
        assert_eq!(config.classify(2), None);
        assert_eq!(config.classify(3), Some(AlertSeverity::Warning));
        assert_eq!(config.classify(5), Some(AlertSeverity::Error));
        assert_eq!(config.classify(12), Some(AlertSeverity::Critical));
    }

    #[test]
    fn test_rejects_fast_interval() {
        let config = HealthCheckConfig {
            interval: Duration::from_millis(10),
            ..HealthCheckConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

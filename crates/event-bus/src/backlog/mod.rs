//! # Backlog Detection
//!
//! Two periodic detectors turn pressure into advisory signals. Neither ever
//! fails a publish or a delivery; they only invoke callbacks.
//!
//! | Side | Samples | Backlog when |
//! |------|---------|--------------|
//! | Publisher | queue depth, publish rate, average publish latency | any threshold breached |
//! | Subscriber | consumer lag count and lag time per topic | either threshold breached |
//!
//! Callbacks run only on a **transition**: a detector that stays backlogged
//! (at the same severity) across ticks stays silent.

mod publisher;
mod subscriber;

use std::time::Duration;

use bus_types::{BacklogSeverity, ConfigError};
use serde::{Deserialize, Serialize};

pub use publisher::PublisherBacklogDetector;
pub use subscriber::{LagSource, SubscriberBacklogDetector, TransportLagSource};

/// Ratio cut-offs mapping a backlog ratio in `[0, 1]` to a severity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityPolicy {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            low: 0.3,
            medium: 0.5,
            high: 0.7,
            critical: 0.9,
        }
    }
}

impl SeverityPolicy {
    #[must_use]
    pub fn classify(&self, ratio: f64) -> BacklogSeverity {
        if ratio >= self.critical {
            BacklogSeverity::Critical
        } else if ratio >= self.high {
            BacklogSeverity::High
        } else if ratio >= self.medium {
            BacklogSeverity::Medium
        } else if ratio >= self.low {
            BacklogSeverity::Low
        } else {
            BacklogSeverity::Normal
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ordered = 0.0 <= self.low
            && self.low <= self.medium
            && self.medium <= self.high
            && self.high <= self.critical
            && self.critical <= 1.0;
        if ordered {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                field: "publisher_backlog.severity",
                reason: "need 0 <= low <= medium <= high <= critical <= 1".into(),
            })
        }
    }
}

/// Publisher-side thresholds. A zero threshold is disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherBacklogConfig {
    pub enabled: bool,
    pub max_queue_depth: i64,
    #[serde(with = "bus_types::serde_ms")]
    pub max_publish_latency: Duration,
    /// Messages per second.
    pub rate_threshold: f64,
    #[serde(with = "bus_types::serde_ms")]
    pub check_interval: Duration,
    pub severity: SeverityPolicy,
}

impl Default for PublisherBacklogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_queue_depth: 1000,
            max_publish_latency: Duration::from_secs(5),
            rate_threshold: 500.0,
            check_interval: Duration::from_secs(30),
            severity: SeverityPolicy::default(),
        }
    }
}

impl PublisherBacklogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "publisher_backlog.check_interval",
                reason: "must be positive".into(),
            });
        }
        if self.max_queue_depth < 0 || self.rate_threshold < 0.0 {
            return Err(ConfigError::Invalid {
                field: "publisher_backlog.thresholds",
                reason: "must not be negative".into(),
            });
        }
        self.severity.validate()
    }
}

/// Subscriber-side thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberBacklogConfig {
    pub enabled: bool,
    #[serde(with = "bus_types::serde_ms")]
    pub check_interval: Duration,
    pub max_lag_threshold: i64,
    #[serde(with = "bus_types::serde_ms")]
    pub max_time_threshold: Duration,
}

impl Default for SubscriberBacklogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: Duration::from_secs(30),
            max_lag_threshold: 1000,
            max_time_threshold: Duration::from_secs(300),
        }
    }
}

impl SubscriberBacklogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "subscriber_backlog.check_interval",
                reason: "must be positive".into(),
            });
        }
        if self.max_lag_threshold < 0 {
            return Err(ConfigError::Invalid {
                field: "subscriber_backlog.max_lag_threshold",
                reason: "must not be negative".into(),
            });
        }
        Ok(())
    }
}

//! Publish options, retry policy and outbox acknowledgements.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exponential backoff for `publish_with_options`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. 0 disables retrying.
    pub max_retries: u32,
    #[serde(with = "crate::serde_ms")]
    pub initial_interval: Duration,
    #[serde(with = "crate::serde_ms")]
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exp);
        let millis = self.initial_interval.as_millis() as f64 * factor;
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Options for `publish_with_options`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Forwarded as the `X-Aggregate-ID` header and broker key.
    pub aggregate_id: Option<String>,
    /// Forwarded as transport headers.
    pub metadata: HashMap<String, String>,
    /// Per-attempt timeout; the bus default applies when unset.
    #[serde(with = "crate::serde_ms::option", default)]
    pub timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
}

/// Acknowledgement of a `publish_envelope` call, for outbox processors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub event_id: String,
    pub topic: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub aggregate_id: String,
    pub event_type: String,
}

//! # Consume Rate Limiter
//!
//! Token bucket in front of handler dispatch. Each delivery takes one
//! token; when the bucket is empty the dispatch waits, and because
//! transports await dispatch before fetching the next delivery, the wait
//! pushes back on the broker instead of piling work into memory.
//!
//! ## Adaptive Mode
//!
//! With `adaptive.enabled`, handler outcomes feed two moving averages. At
//! most once per `adapt_interval` the rate drops by 20% while the error
//! average is above `error_threshold`, or rises by 20% while the success
//! average is above `success_threshold`, clamped to the configured range.

use std::time::Duration;

use bus_types::ConfigError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Waits longer than this are logged.
const SLOW_WAIT: Duration = Duration::from_millis(100);
/// Weight of the newest outcome in the moving averages.
const OUTCOME_WEIGHT: f64 = 0.1;

/// Adaptive rate tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveRateLimitConfig {
    pub enabled: bool,
    pub min_rate_per_second: f64,
    pub max_rate_per_second: f64,
    #[serde(with = "bus_types::serde_ms")]
    pub adapt_interval: Duration,
    pub error_threshold: f64,
    pub success_threshold: f64,
}

impl Default for AdaptiveRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_rate_per_second: 10.0,
            max_rate_per_second: 10_000.0,
            adapt_interval: Duration::from_secs(10),
            error_threshold: 0.1,
            success_threshold: 0.9,
        }
    }
}

/// Consume-side rate limiting. Disabled by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub rate_per_second: f64,
    /// Tokens available at once.
    pub burst_size: u32,
    pub adaptive: AdaptiveRateLimitConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate_per_second: 1000.0,
            burst_size: 100,
            adaptive: AdaptiveRateLimitConfig::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if !is_positive(self.rate_per_second) {
            return Err(ConfigError::Invalid {
                field: "rate_limit.rate_per_second",
                reason: format!("{} is not positive", self.rate_per_second),
            });
        }
        if self.burst_size == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit.burst_size",
                reason: "must be at least 1".into(),
            });
        }
        let adaptive = &self.adaptive;
        if adaptive.enabled
            && (!is_positive(adaptive.min_rate_per_second)
                || adaptive.min_rate_per_second > adaptive.max_rate_per_second)
        {
            return Err(ConfigError::Invalid {
                field: "rate_limit.adaptive",
                reason: format!(
                    "rate range {}..{} is empty or not positive",
                    adaptive.min_rate_per_second, adaptive.max_rate_per_second
                ),
            });
        }
        Ok(())
    }
}

fn is_positive(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

/// Point-in-time view of a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub rate_per_second: f64,
    pub burst_size: u32,
    pub tokens_available: f64,
    pub adaptive: bool,
    pub error_rate: f64,
    pub success_rate: f64,
}

struct Bucket {
    rate: f64,
    burst: u32,
    /// Negative while waiters hold reservations.
    tokens: f64,
    last_refill: Instant,
    error_rate: f64,
    success_rate: f64,
    last_adapt: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(f64::from(self.burst));
        self.last_refill = now;
    }
}

/// Token bucket with optional adaptive rate.
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        let bucket = Bucket {
            rate: config.rate_per_second,
            burst: config.burst_size,
            tokens: f64::from(config.burst_size),
            last_refill: now,
            error_rate: 0.0,
            success_rate: 0.0,
            last_adapt: now,
        };
        Self {
            config,
            bucket: Mutex::new(bucket),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Take one token, waiting for it if the bucket is empty.
    pub async fn acquire(&self) {
        if !self.config.enabled {
            return;
        }
        let wait = {
            let mut bucket = self.bucket.lock();
            bucket.refill(Instant::now());
            bucket.tokens -= 1.0;
            if bucket.tokens >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-bucket.tokens / bucket.rate)
        };
        if wait > SLOW_WAIT {
            warn!(?wait, rate = self.current_rate(), "Rate limiter delaying dispatch");
        } else {
            debug!(?wait, "Rate limited");
        }
        tokio::time::sleep(wait).await;
    }

    /// Take one token if one is available now.
    pub fn try_acquire(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn current_rate(&self) -> f64 {
        self.bucket.lock().rate
    }

    /// Change the refill rate. Ignored when disabled or not positive.
    pub fn set_rate(&self, rate_per_second: f64) {
        if !self.config.enabled || !is_positive(rate_per_second) {
            return;
        }
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.rate = rate_per_second;
        info!(rate = rate_per_second, burst = bucket.burst, "Rate limit updated");
    }

    /// Change the bucket size. Ignored when disabled or zero.
    pub fn set_burst(&self, burst_size: u32) {
        if !self.config.enabled || burst_size == 0 {
            return;
        }
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.burst = burst_size;
        bucket.tokens = bucket.tokens.min(f64::from(burst_size));
        info!(rate = bucket.rate, burst = burst_size, "Burst size updated");
    }

    /// Feed a handler outcome to adaptive mode. No-op otherwise.
    pub fn record_outcome(&self, succeeded: bool) {
        let adaptive = &self.config.adaptive;
        if !self.config.enabled || !adaptive.enabled {
            return;
        }
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        let (ok, err) = if succeeded { (1.0, 0.0) } else { (0.0, 1.0) };
        bucket.success_rate = bucket.success_rate * (1.0 - OUTCOME_WEIGHT) + ok * OUTCOME_WEIGHT;
        bucket.error_rate = bucket.error_rate * (1.0 - OUTCOME_WEIGHT) + err * OUTCOME_WEIGHT;

        if now.saturating_duration_since(bucket.last_adapt) < adaptive.adapt_interval {
            return;
        }
        bucket.last_adapt = now;

        let current = bucket.rate;
        let next = if bucket.error_rate > adaptive.error_threshold {
            (current * 0.8).max(adaptive.min_rate_per_second)
        } else if bucket.success_rate > adaptive.success_threshold {
            (current * 1.2).min(adaptive.max_rate_per_second)
        } else {
            current
        };
        if (next - current).abs() > f64::EPSILON {
            bucket.refill(now);
            bucket.rate = next;
            info!(
                from = current,
                to = next,
                error_rate = bucket.error_rate,
                success_rate = bucket.success_rate,
                "Adaptive rate limit adjusted"
            );
        }
    }

    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        RateLimiterStats {
            enabled: self.config.enabled,
            rate_per_second: bucket.rate,
            burst_size: bucket.burst,
            tokens_available: bucket.tokens.max(0.0),
            adaptive: self.config.enabled && self.config.adaptive.enabled,
            error_rate: bucket.error_rate,
            success_rate: bucket.success_rate,
        }
    }
}

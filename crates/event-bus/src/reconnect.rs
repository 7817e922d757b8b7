//! # Auto-Reconnect
//!
//! Bounded exponential backoff around [`Transport::reconnect`]. After a
//! successful reconnect the caller-supplied replay step re-establishes every
//! recorded subscription, then reconnect callbacks run in registration order.
//!
//! ```text
//! attempt 1 ─ fail ─ sleep 1s ─ attempt 2 ─ fail ─ sleep 2s ─ ... ─ attempt N ─ fail ─► terminal
//!                                              └─ ok ─► replay ─► callbacks ─► healthy
//! ```
//!
//! Reconnects are serialized. A caller that queued behind an attempt which
//! then succeeded returns `Ok` without reconnecting again, so replay and
//! callbacks run once per recovery.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bus_types::{BusError, ConfigError, ReconnectStatus};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::callbacks::CallbackList;
use crate::transport::Transport;

/// Attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// First backoff delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Backoff ceiling.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Reconnect tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    #[serde(with = "bus_types::serde_ms")]
    pub initial_backoff: Duration,
    #[serde(with = "bus_types::serde_ms")]
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    /// Consecutive failed health checks that trigger a reconnect.
    pub failure_threshold: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_factor: 2.0,
            failure_threshold: 3,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "reconnect.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid {
                field: "reconnect.backoff_factor",
                reason: format!("{} is below 1.0", self.backoff_factor),
            });
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "reconnect.failure_threshold",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Delay after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = delay.mul_f64(self.backoff_factor.max(1.0));
            if delay >= self.max_backoff {
                return self.max_backoff;
            }
        }
        delay.min(self.max_backoff)
    }
}

/// Drives reconnect attempts and owns the reconnect callbacks.
pub struct ReconnectController {
    config: ReconnectConfig,
    status: Arc<RwLock<ReconnectStatus>>,
    callbacks: CallbackList<()>,
    /// Held across reconnect, replay and callbacks.
    gate: tokio::sync::Mutex<()>,
    /// Bumped after every successful reconnect.
    generation: AtomicU64,
}

/// Clears `is_reconnecting` even when the attempt future is dropped.
struct ReconnectingGuard(Arc<RwLock<ReconnectStatus>>);

impl Drop for ReconnectingGuard {
    fn drop(&mut self) {
        self.0.write().is_reconnecting = false;
    }
}

impl ReconnectController {
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            status: Arc::new(RwLock::new(ReconnectStatus::default())),
            callbacks: CallbackList::new("reconnect"),
            gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    #[must_use]
    pub fn status(&self) -> ReconnectStatus {
        self.status.read().clone()
    }

    #[must_use]
    pub fn callbacks(&self) -> &CallbackList<()> {
        &self.callbacks
    }

    /// Successful reconnects so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The connection proved healthy without a reconnect; clear the
    /// terminal flag left by an exhausted attempt.
    pub fn mark_recovered(&self) {
        let mut status = self.status.write();
        if status.terminal_failed || status.failure_count > 0 {
            status.terminal_failed = false;
            status.failure_count = 0;
            info!("Connection recovered outside the reconnect loop");
        }
    }

    /// Reconnect `transport`, run `replay`, then notify callbacks.
    ///
    /// `replay` errors are logged; a reconnected transport with a partially
    /// restored subscription set still counts as recovered. A caller that
    /// waited on an attempt which succeeded returns `Ok` straight away.
    pub async fn reconnect<F, Fut>(&self, transport: &dyn Transport, replay: F) -> Result<(), BusError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<usize, BusError>>,
    {
        let seen = self.generation.load(Ordering::Acquire);
        let _serial = self.gate.lock().await;
        if self.generation.load(Ordering::Acquire) != seen {
            debug!("Reconnect already completed by a concurrent caller");
            return Ok(());
        }

        self.status.write().is_reconnecting = true;
        let _guard = ReconnectingGuard(self.status.clone());

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_attempts {
            match transport.reconnect().await {
                Ok(()) => {
                    match replay().await {
                        Ok(restored) => info!(attempt, restored, "Subscriptions restored"),
                        Err(e) => warn!(attempt, error = %e, "Subscription replay incomplete"),
                    }
                    {
                        let mut status = self.status.write();
                        status.failure_count = 0;
                        status.last_reconnect_time = Some(Utc::now());
                        status.terminal_failed = false;
                    }
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    let failed = self.callbacks.notify(()).await;
                    info!(
                        attempt,
                        callbacks = self.callbacks.len(),
                        failed,
                        "Transport reconnected"
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.status.write().failure_count += 1;
                    last_error = e.to_string();
                    warn!(attempt, max = self.config.max_attempts, error = %e, "Reconnect attempt failed");
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.config.backoff_for(attempt)).await;
                    }
                }
            }
        }

        self.status.write().terminal_failed = true;
        error!(
            attempts = self.config.max_attempts,
            error = %last_error,
            "Reconnect attempts exhausted"
        );
        Err(BusError::ReconnectExhausted {
            attempts: self.config.max_attempts,
            last_error,
        })
    }
}

//! # Topic Configuration Manager
//!
//! Reconciles the desired [`TopicOptions`] of a topic with the broker
//! according to the active [`TopicConfigStrategy`]:
//!
//! | Strategy | Missing topic | Existing topic |
//! |----------|---------------|----------------|
//! | `CreateOnly` | create | keep, report differences |
//! | `CreateOrUpdate` | create | update when different |
//! | `ValidateOnly` | `NotConfigured` | error on any difference |
//! | `Skip` | record locally | record locally |
//!
//! `Skip` never touches the control plane. For every other strategy an
//! existing topic is checked first: partitions may only grow and the
//! replication factor is fixed.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bus_types::{
    PersistenceMode, TopicConfigError, TopicConfigMismatch, TopicConfigStrategy, TopicOptions,
    TopicSyncAction, TopicSyncResult, TransportError,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::transport::Transport;

/// Retention differences up to this much are ignored.
pub const RETENTION_TOLERANCE: Duration = Duration::from_secs(1);

/// Manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfigManagerConfig {
    pub strategy: TopicConfigStrategy,
    /// Compare existing topics and report mismatches under `CreateOnly`.
    pub validate_existing: bool,
    /// Bound on each control-plane call.
    #[serde(with = "bus_types::serde_ms")]
    pub sync_timeout: Duration,
}

impl Default for TopicConfigManagerConfig {
    fn default() -> Self {
        Self {
            strategy: TopicConfigStrategy::CreateOrUpdate,
            validate_existing: true,
            sync_timeout: Duration::from_secs(30),
        }
    }
}

impl TopicConfigManagerConfig {
    /// Development: create and update freely.
    #[must_use]
    pub fn development() -> Self {
        Self::default()
    }

    /// Production: create missing topics, never modify existing ones.
    #[must_use]
    pub fn production() -> Self {
        Self {
            strategy: TopicConfigStrategy::CreateOnly,
            ..Self::default()
        }
    }

    /// Strict: topics must already exist exactly as configured.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            strategy: TopicConfigStrategy::ValidateOnly,
            ..Self::default()
        }
    }
}

/// Applies topic options to a transport and remembers them.
pub struct TopicConfigManager {
    transport: Arc<dyn Transport>,
    config: RwLock<TopicConfigManagerConfig>,
    topics: RwLock<BTreeMap<String, TopicOptions>>,
}

impl TopicConfigManager {
    #[must_use]
    pub fn new(config: TopicConfigManagerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: RwLock::new(config),
            topics: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn strategy(&self) -> TopicConfigStrategy {
        self.config.read().strategy
    }

    pub fn set_strategy(&self, strategy: TopicConfigStrategy) {
        let previous = std::mem::replace(&mut self.config.write().strategy, strategy);
        info!(from = %previous, to = %strategy, "Topic config strategy changed");
    }

    /// Options last applied for `topic`.
    pub fn get(&self, topic: &str) -> Result<TopicOptions, TopicConfigError> {
        self.topics
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| TopicConfigError::NotConfigured(topic.to_string()))
    }

    /// Configured topic names, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.topics.read().keys().cloned().collect()
    }

    /// Forget the local config. The broker topic is left alone.
    pub fn remove(&self, topic: &str) -> Result<(), TopicConfigError> {
        match self.topics.write().remove(topic) {
            Some(_) => {
                debug!(topic, "Topic config removed");
                Ok(())
            }
            None => Err(TopicConfigError::NotConfigured(topic.to_string())),
        }
    }

    /// Whether `topic` resolves to persistent storage on this transport.
    #[must_use]
    pub fn is_persistent(&self, topic: &str) -> bool {
        let default = self.transport.persistent_by_default();
        self.topics
            .read()
            .get(topic)
            .map_or(default, |options| options.is_persistent(default))
    }

    /// Change only the persistence mode of `topic`, keeping its other options.
    pub async fn set_persistence(
        &self,
        topic: &str,
        persistent: bool,
    ) -> Result<TopicSyncResult, TopicConfigError> {
        let mut options = self.topics.read().get(topic).cloned().unwrap_or_default();
        options.persistence_mode = if persistent {
            PersistenceMode::Persistent
        } else {
            PersistenceMode::Ephemeral
        };
        self.configure(topic, options).await
    }

    /// Reconcile `topic` with `options` under the current strategy.
    pub async fn configure(
        &self,
        topic: &str,
        options: TopicOptions,
    ) -> Result<TopicSyncResult, TopicConfigError> {
        if topic.trim().is_empty() {
            return Err(TopicConfigError::EmptyTopic);
        }
        let started = Instant::now();
        let config = self.config.read().clone();

        let outcome = self.reconcile(topic, &options, &config).await;
        match outcome {
            Ok((action, mismatches, stored)) => {
                self.topics.write().insert(topic.to_string(), stored);
                let result = TopicSyncResult {
                    topic: topic.to_string(),
                    action,
                    success: true,
                    error: None,
                    mismatches,
                    duration: started.elapsed(),
                };
                info!(
                    topic,
                    strategy = %config.strategy,
                    action = ?result.action,
                    mismatches = result.mismatches.len(),
                    duration = ?result.duration,
                    "Topic configured"
                );
                Ok(result)
            }
            Err(e) => {
                error!(topic, strategy = %config.strategy, error = %e, "Topic configuration failed");
                Err(e)
            }
        }
    }

    /// Apply `desired` and re-apply every other recorded topic, in name
    /// order. Every topic is attempted even after a failure.
    pub async fn sync_all(
        &self,
        desired: &BTreeMap<String, TopicOptions>,
    ) -> Vec<Result<TopicSyncResult, TopicConfigError>> {
        let mut topics = self.topics.read().clone();
        topics.extend(desired.iter().map(|(t, o)| (t.clone(), o.clone())));
        let mut results = Vec::with_capacity(topics.len());
        for (topic, options) in topics {
            results.push(self.configure(&topic, options).await);
        }
        results
    }

    async fn reconcile(
        &self,
        topic: &str,
        options: &TopicOptions,
        config: &TopicConfigManagerConfig,
    ) -> Result<(TopicSyncAction, Vec<TopicConfigMismatch>, TopicOptions), TopicConfigError> {
        if config.strategy == TopicConfigStrategy::Skip {
            debug!(topic, "Skip strategy, control plane untouched");
            return Ok((TopicSyncAction::Skipped, Vec::new(), options.clone()));
        }

        let timeout = config.sync_timeout;
        let existing = bounded(timeout, self.transport.describe_topic(topic)).await?;

        let Some(actual) = existing else {
            if !config.strategy.creates() {
                return Err(TopicConfigError::NotConfigured(topic.to_string()));
            }
            bounded(timeout, self.transport.create_topic(topic, options)).await?;
            return Ok((TopicSyncAction::Created, Vec::new(), options.clone()));
        };

        check_immutable(topic, options, &actual)?;
        let persistent_default = self.transport.persistent_by_default();
        let mismatches = compare_topic_options(topic, options, &actual, persistent_default);

        match config.strategy {
            TopicConfigStrategy::CreateOnly => {
                if config.validate_existing {
                    for mismatch in &mismatches {
                        warn!(
                            topic,
                            %mismatch,
                            recommendation = %mismatch.recommendation,
                            "Existing topic differs, keeping it"
                        );
                    }
                }
                Ok((TopicSyncAction::Kept, mismatches, actual))
            }
            TopicConfigStrategy::CreateOrUpdate => {
                if *options == actual {
                    return Ok((TopicSyncAction::Kept, Vec::new(), actual));
                }
                bounded(timeout, self.transport.update_topic(topic, options)).await?;
                Ok((TopicSyncAction::Updated, mismatches, options.clone()))
            }
            TopicConfigStrategy::ValidateOnly => {
                if mismatches.is_empty() {
                    return Ok((TopicSyncAction::Validated, Vec::new(), actual));
                }
                let details = mismatches
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(TopicConfigError::Mismatch {
                    topic: topic.to_string(),
                    details,
                })
            }
            TopicConfigStrategy::Skip => Ok((TopicSyncAction::Skipped, Vec::new(), options.clone())),
        }
    }
}

async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

fn check_immutable(
    topic: &str,
    expected: &TopicOptions,
    actual: &TopicOptions,
) -> Result<(), TopicConfigError> {
    if expected.partitions < actual.partitions {
        return Err(TopicConfigError::PartitionDecrease {
            topic: topic.to_string(),
            current: actual.partitions,
            requested: expected.partitions,
        });
    }
    if expected.replication_factor != actual.replication_factor {
        return Err(TopicConfigError::Immutable {
            topic: topic.to_string(),
            field: "replication_factor",
        });
    }
    Ok(())
}

/// Field-by-field differences between desired and broker config.
#[must_use]
pub fn compare_topic_options(
    topic: &str,
    expected: &TopicOptions,
    actual: &TopicOptions,
    persistent_by_default: bool,
) -> Vec<TopicConfigMismatch> {
    let mut mismatches = Vec::new();
    let mut push = |field: &str, expected: String, actual: String, can_auto_fix: bool| {
        let recommendation = if can_auto_fix {
            format!("{field} can be updated; use the create_or_update strategy to apply it")
        } else {
            format!("{field} cannot change after creation; create a new topic instead")
        };
        mismatches.push(TopicConfigMismatch {
            topic: topic.to_string(),
            field: field.to_string(),
            expected,
            actual,
            can_auto_fix,
            recommendation,
        });
    };

    let want_persistent = expected.is_persistent(persistent_by_default);
    let have_persistent = actual.is_persistent(persistent_by_default);
    if want_persistent != have_persistent {
        push(
            "persistence_mode",
            persistence_label(want_persistent).into(),
            persistence_label(have_persistent).into(),
            false,
        );
    }

    if !expected.retention_time.is_zero() && !actual.retention_time.is_zero() {
        let diff = if expected.retention_time > actual.retention_time {
            expected.retention_time - actual.retention_time
        } else {
            actual.retention_time - expected.retention_time
        };
        if diff > RETENTION_TOLERANCE {
            push(
                "retention_time",
                format!("{:?}", expected.retention_time),
                format!("{:?}", actual.retention_time),
                true,
            );
        }
    }

    if expected.max_size > 0 && actual.max_size > 0 && expected.max_size != actual.max_size {
        push(
            "max_size",
            expected.max_size.to_string(),
            actual.max_size.to_string(),
            true,
        );
    }
    if expected.max_messages > 0
        && actual.max_messages > 0
        && expected.max_messages != actual.max_messages
    {
        push(
            "max_messages",
            expected.max_messages.to_string(),
            actual.max_messages.to_string(),
            true,
        );
    }
    if expected.partitions != actual.partitions {
        push(
            "partitions",
            expected.partitions.to_string(),
            actual.partitions.to_string(),
            expected.partitions > actual.partitions,
        );
    }
    if expected.replication_factor != actual.replication_factor {
        push(
            "replication_factor",
            expected.replication_factor.to_string(),
            actual.replication_factor.to_string(),
            false,
        );
    }
    if expected.compression != actual.compression {
        push(
            "compression",
            expected.compression.as_str().into(),
            actual.compression.as_str().into(),
            true,
        );
    }
    mismatches
}

fn persistence_label(persistent: bool) -> &'static str {
    if persistent {
        "persistent"
    } else {
        "ephemeral"
    }
}

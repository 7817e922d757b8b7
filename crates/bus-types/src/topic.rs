//! # Topic Options and Configuration Strategies
//!
//! | Strategy | Create if absent | Update if present | Use case |
//! |---|---|---|---|
//! | `CreateOnly` | yes | no, keeps existing | production |
//! | `CreateOrUpdate` | yes | yes | development |
//! | `ValidateOnly` | no | validates, errors on mismatch | staging / strict |
//! | `Skip` | no | no, zero control-plane calls | steady state |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Whether a topic is stored durably by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    Persistent,
    Ephemeral,
    /// Follow the transport's global default.
    #[default]
    Auto,
}

/// Broker-side compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

/// Per-topic policy.
///
/// Partitions may only increase and the replication factor is fixed once
/// the topic exists. Both rules are enforced regardless of strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicOptions {
    pub persistence_mode: PersistenceMode,
    #[serde(with = "crate::serde_ms")]
    pub retention_time: Duration,
    /// Bytes, 0 means unlimited.
    pub max_size: u64,
    /// 0 means unlimited.
    pub max_messages: u64,
    pub partitions: u32,
    pub replication_factor: u32,
    pub compression: Compression,
    #[serde(default)]
    pub description: String,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            persistence_mode: PersistenceMode::Auto,
            retention_time: Duration::from_secs(24 * 60 * 60),
            max_size: 100 * 1024 * 1024,
            max_messages: 10_000,
            partitions: 1,
            replication_factor: 1,
            compression: Compression::None,
            description: String::new(),
        }
    }
}

impl TopicOptions {
    /// Default options with `Persistent` mode.
    #[must_use]
    pub fn persistent() -> Self {
        Self {
            persistence_mode: PersistenceMode::Persistent,
            ..Self::default()
        }
    }

    /// Default options with `Ephemeral` mode.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            persistence_mode: PersistenceMode::Ephemeral,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_time = retention;
        self
    }

    #[must_use]
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    /// Resolve `Auto` against the transport's default.
    #[must_use]
    pub fn is_persistent(&self, transport_default: bool) -> bool {
        match self.persistence_mode {
            PersistenceMode::Persistent => true,
            PersistenceMode::Ephemeral => false,
            PersistenceMode::Auto => transport_default,
        }
    }
}

/// How `configure_topic` treats the broker's control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicConfigStrategy {
    CreateOnly,
    #[default]
    CreateOrUpdate,
    ValidateOnly,
    Skip,
}

impl TopicConfigStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateOnly => "create_only",
            Self::CreateOrUpdate => "create_or_update",
            Self::ValidateOnly => "validate_only",
            Self::Skip => "skip",
        }
    }

    /// Whether this strategy may create a missing topic.
    #[must_use]
    pub fn creates(&self) -> bool {
        matches!(self, Self::CreateOnly | Self::CreateOrUpdate)
    }

    /// Whether this strategy may change an existing topic.
    #[must_use]
    pub fn updates(&self) -> bool {
        matches!(self, Self::CreateOrUpdate)
    }
}

impl fmt::Display for TopicConfigStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopicConfigStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create_only" => Ok(Self::CreateOnly),
            "create_or_update" => Ok(Self::CreateOrUpdate),
            "validate_only" => Ok(Self::ValidateOnly),
            "skip" => Ok(Self::Skip),
            other => Err(ConfigError::Invalid {
                field: "topic_strategy",
                reason: format!("unknown strategy '{other}'"),
            }),
        }
    }
}

/// One field that differs between the expected and the actual topic config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfigMismatch {
    pub topic: String,
    pub field: String,
    pub expected: String,
    pub actual: String,
    /// Whether `CreateOrUpdate` could reconcile this field.
    pub can_auto_fix: bool,
    pub recommendation: String,
}

impl fmt::Display for TopicConfigMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, actual {}",
            self.field, self.expected, self.actual
        )
    }
}

/// What `configure_topic` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicSyncAction {
    Created,
    Updated,
    /// Existing topic left untouched under `CreateOnly`.
    Kept,
    Validated,
    Skipped,
}

/// Outcome of one `configure_topic` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSyncResult {
    pub topic: String,
    pub action: TopicSyncAction,
    pub success: bool,
    pub error: Option<String>,
    pub mismatches: Vec<TopicConfigMismatch>,
    #[serde(with = "crate::serde_ms")]
    pub duration: Duration,
}

//! Subscriber-side backlog detector.
//!
//! Samples consumer lag for every watched topic from a [`LagSource`] and
//! reports a [`BacklogState`] when a topic enters or leaves backlog.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bus_types::{BacklogState, BusError, TransportError};
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::SubscriberBacklogConfig;
use crate::callbacks::CallbackList;
use crate::task::{ticker, BackgroundTask, TaskSlot};
use crate::transport::{LagSample, Transport};

/// Where consumer lag comes from.
#[async_trait]
pub trait LagSource: Send + Sync + 'static {
    async fn lag(&self, topic: &str) -> Result<Option<LagSample>, TransportError>;
}

/// Asks the transport for its own consumer lag.
pub struct TransportLagSource(pub Arc<dyn Transport>);

#[async_trait]
impl LagSource for TransportLagSource {
    async fn lag(&self, topic: &str) -> Result<Option<LagSample>, TransportError> {
        self.0.consumer_lag(topic).await
    }
}

struct Shared {
    config: SubscriberBacklogConfig,
    source: Arc<dyn LagSource>,
    topics: RwLock<BTreeSet<String>>,
    backlogged: RwLock<HashMap<String, bool>>,
    latest: RwLock<HashMap<String, BacklogState>>,
    callbacks: CallbackList<BacklogState>,
}

/// Watches consumer lag on a set of topics.
pub struct SubscriberBacklogDetector {
    shared: Arc<Shared>,
    task: TaskSlot,
}

impl SubscriberBacklogDetector {
    #[must_use]
    pub fn new(config: SubscriberBacklogConfig, source: Arc<dyn LagSource>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                source,
                topics: RwLock::new(BTreeSet::new()),
                backlogged: RwLock::new(HashMap::new()),
                latest: RwLock::new(HashMap::new()),
                callbacks: CallbackList::new("subscriber_backlog"),
            }),
            task: TaskSlot::default(),
        }
    }

    #[must_use]
    pub fn callbacks(&self) -> &CallbackList<BacklogState> {
        &self.shared.callbacks
    }

    pub fn watch_topic(&self, topic: impl Into<String>) {
        self.shared.topics.write().insert(topic.into());
    }

    pub fn unwatch_topic(&self, topic: &str) {
        self.shared.topics.write().remove(topic);
        self.shared.backlogged.write().remove(topic);
        self.shared.latest.write().remove(topic);
    }

    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.shared.topics.read().iter().cloned().collect()
    }

    /// Most recent sample for `topic`.
    #[must_use]
    pub fn state(&self, topic: &str) -> Option<BacklogState> {
        self.shared.latest.read().get(topic).cloned()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    pub fn start(&self) -> Result<(), BusError> {
        let shared = self.shared.clone();
        let started = self.task.start_with(|| {
            BackgroundTask::spawn("subscriber_backlog", move |stop| run(shared, stop))
        });
        if !started {
            return Err(BusError::AlreadyRunning("subscriber backlog detector"));
        }
        info!(
            interval = ?self.shared.config.check_interval,
            max_lag = self.shared.config.max_lag_threshold,
            "Subscriber backlog detector started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if self.task.stop().await {
            info!("Subscriber backlog detector stopped");
        }
    }

    /// Sample every topic once; returns the transitions reported.
    pub async fn check_once(&self) -> Vec<BacklogState> {
        check(&self.shared).await
    }
}

async fn run(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut interval = ticker(shared.config.check_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        check(&shared).await;
    }
    debug!("Subscriber backlog loop exited");
}

async fn check(shared: &Shared) -> Vec<BacklogState> {
    let topics: Vec<String> = shared.topics.read().iter().cloned().collect();
    let mut transitions = Vec::new();

    for topic in topics {
        let sample = match shared.source.lag(&topic).await {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                debug!(topic = %topic, "No lag information");
                continue;
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Lag sampling failed");
                continue;
            }
        };

        let has_backlog = sample.lag_count > shared.config.max_lag_threshold
            || sample.lag_time > shared.config.max_time_threshold;
        let state = BacklogState {
            topic: topic.clone(),
            consumer_group: sample.consumer_group,
            lag_count: sample.lag_count,
            lag_time: sample.lag_time,
            has_backlog,
            timestamp: Utc::now(),
        };
        shared.latest.write().insert(topic.clone(), state.clone());

        let previous = shared
            .backlogged
            .write()
            .insert(topic.clone(), has_backlog)
            .unwrap_or(false);
        if previous == has_backlog {
            continue;
        }

        if has_backlog {
            warn!(
                topic = %topic,
                lag = state.lag_count,
                lag_time = ?state.lag_time,
                "Consumer backlog detected"
            );
        } else {
            info!(topic = %topic, lag = state.lag_count, "Consumer backlog cleared");
        }
        shared.callbacks.notify(state.clone()).await;
        transitions.push(state);
    }
    transitions
}

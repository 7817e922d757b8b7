//! # Topic Reconciliation
//!
//! Every strategy against a broker that already holds some topics.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bus_types::{
        BusError, PersistenceMode, TopicConfigError, TopicConfigStrategy, TopicOptions,
        TopicSyncAction,
    };
    use event_bus::Transport;

    use crate::fixtures::{memory_bus, test_config};

    fn seven_days() -> TopicOptions {
        TopicOptions::persistent().with_retention(Duration::from_secs(7 * 24 * 60 * 60))
    }

    #[tokio::test]
    async fn test_skip_never_calls_the_broker() {
        let (bus, transport) = memory_bus(test_config());
        bus.set_topic_config_strategy(TopicConfigStrategy::Skip);

        let result = bus.configure_topic("orders", seven_days()).await.unwrap();
        assert_eq!(result.action, TopicSyncAction::Skipped);
        assert_eq!(transport.control_plane_calls(), 0);
        assert_eq!(bus.get_topic_config("orders").unwrap(), seven_days());
        assert!(transport.describe_topic("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_only_keeps_existing_topic() {
        let (bus, transport) = memory_bus(test_config());
        transport
            .create_topic("orders", &TopicOptions::ephemeral())
            .await
            .unwrap();
        bus.set_topic_config_strategy(TopicConfigStrategy::CreateOnly);

        let result = bus.configure_topic("orders", seven_days()).await.unwrap();
        assert_eq!(result.action, TopicSyncAction::Kept);
        assert!(!result.mismatches.is_empty());
        assert_eq!(
            transport.describe_topic("orders").await.unwrap(),
            Some(TopicOptions::ephemeral())
        );
        // The broker's config is what gets recorded.
        assert_eq!(
            bus.get_topic_config("orders").unwrap().persistence_mode,
            PersistenceMode::Ephemeral
        );

        let created = bus.configure_topic("payments", seven_days()).await.unwrap();
        assert_eq!(created.action, TopicSyncAction::Created);
    }

    #[tokio::test]
    async fn test_validate_only_rejects_drift_and_missing_topics() {
        let (bus, transport) = memory_bus(test_config());
        transport
            .create_topic("orders", &TopicOptions::ephemeral())
            .await
            .unwrap();
        bus.set_topic_config_strategy(TopicConfigStrategy::ValidateOnly);

        let err = bus.configure_topic("orders", seven_days()).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::TopicConfig(TopicConfigError::Mismatch { .. })
        ));

        let err = bus.configure_topic("missing", seven_days()).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::TopicConfig(TopicConfigError::NotConfigured(_))
        ));

        let ok = bus
            .configure_topic("orders", TopicOptions::ephemeral())
            .await
            .unwrap();
        assert_eq!(ok.action, TopicSyncAction::Validated);
    }

    #[tokio::test]
    async fn test_partitions_never_shrink() {
        let (bus, transport) = memory_bus(test_config());
        transport
            .create_topic("orders", &TopicOptions::default().with_partitions(6))
            .await
            .unwrap();

        let err = bus
            .configure_topic("orders", TopicOptions::default().with_partitions(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::TopicConfig(TopicConfigError::PartitionDecrease {
                current: 6,
                requested: 3,
                ..
            })
        ));

        let grown = bus
            .configure_topic("orders", TopicOptions::default().with_partitions(12))
            .await
            .unwrap();
        assert_eq!(grown.action, TopicSyncAction::Updated);
        assert_eq!(
            transport.describe_topic("orders").await.unwrap().map(|o| o.partitions),
            Some(12)
        );
    }

    #[tokio::test]
    async fn test_create_or_update_converges() {
        let (bus, transport) = memory_bus(test_config());
        let first = bus.configure_topic("orders", TopicOptions::ephemeral()).await.unwrap();
        assert_eq!(first.action, TopicSyncAction::Created);

        let second = bus.configure_topic("orders", seven_days()).await.unwrap();
        assert_eq!(second.action, TopicSyncAction::Updated);

        let third = bus.configure_topic("orders", seven_days()).await.unwrap();
        assert_eq!(third.action, TopicSyncAction::Kept);
        assert_eq!(transport.describe_topic("orders").await.unwrap(), Some(seven_days()));

        let toggled = bus.set_topic_persistence("orders", false).await.unwrap();
        assert_eq!(toggled.action, TopicSyncAction::Updated);
        assert_eq!(
            bus.get_topic_config("orders").unwrap().retention_time,
            Duration::from_secs(7 * 24 * 60 * 60)
        );
    }

    #[tokio::test]
    async fn test_start_applies_configured_topics() {
        let mut config = test_config();
        config.topics.insert("orders".to_string(), seven_days());
        config.topics.insert("audit".to_string(), TopicOptions::ephemeral());
        let (bus, transport) = memory_bus(config);

        bus.start().await.unwrap();
        assert_eq!(bus.list_configured_topics(), vec!["audit", "orders"]);
        assert_eq!(transport.describe_topic("orders").await.unwrap(), Some(seven_days()));

        bus.remove_topic_config("audit").unwrap();
        assert!(bus.get_topic_config("audit").is_err());
        // The broker topic outlives the local record.
        assert!(transport.describe_topic("audit").await.unwrap().is_some());
        bus.close().await.unwrap();
    }
}

//! # Bus Lifecycle
//!
//! Construction from config, consume-side rate limiting, graceful close
//! with work in flight, and what callers see after the bus is gone.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bus_telemetry::{init_logging, TelemetryConfig};
    use bus_types::{BusError, Envelope, TransportKind};
    use event_bus::{EventBus, EventBusConfig};
    use tokio_stream::StreamExt;

    use crate::fixtures::{bounded, counting, memory_bus, test_config, wait_until};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_drains_every_aggregate() {
        let (bus, _transport) = memory_bus(test_config());
        let handled = Arc::new(AtomicU64::new(0));
        let counter = handled.clone();
        bus.subscribe_envelope("orders", move |_envelope| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        for aggregate in 0..20 {
            for version in 1..=10 {
                let envelope = Envelope::new(
                    format!("order-{aggregate}").as_str(),
                    "OrderUpdated",
                    version,
                    b"{}".to_vec(),
                );
                bus.publish_envelope("orders", &envelope).await.unwrap();
            }
        }

        bounded(Duration::from_secs(10), bus.close()).await.unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 200);
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (bus, transport) = memory_bus(test_config());
        bus.subscribe("audit", counting(Arc::new(AtomicU64::new(0))))
            .await
            .unwrap();

        bus.close().await.unwrap();
        bus.close().await.unwrap();
        assert_eq!(transport.subscription_count(), 0);
        assert_eq!(bus.metrics().active_subscriptions, 0);

        assert_eq!(
            bus.publish("audit", b"{}".to_vec()).await.unwrap_err(),
            BusError::Closed
        );
        let err = bus
            .subscribe("audit", counting(Arc::new(AtomicU64::new(0))))
            .await
            .unwrap_err();
        assert_eq!(err, BusError::Closed);
        assert_eq!(bus.reconnect().await.unwrap_err(), BusError::Closed);
        assert!(bus.start().await.is_err());
    }

    #[tokio::test]
    async fn test_clones_share_one_bus() {
        let (bus, _transport) = memory_bus(test_config());
        let received = Arc::new(AtomicU64::new(0));
        bus.subscribe("audit", counting(received.clone())).await.unwrap();

        let publisher = bus.clone();
        publisher.publish("audit", b"{}".to_vec()).await.unwrap();
        wait_until(Duration::from_secs(3), || received.load(Ordering::SeqCst) == 1).await;
        assert_eq!(bus.metrics().messages_published, 1);

        publisher.close().await.unwrap();
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn test_outbox_sees_every_publish_outcome() {
        let (bus, transport) = memory_bus(test_config());
        let mut results = bus.publish_results();

        let created = Envelope::new("order-7", "OrderCreated", 1, b"{}".to_vec());
        bus.publish_envelope("orders", &created).await.unwrap();
        transport.disconnect();
        let shipped = Envelope::new("order-7", "OrderShipped", 2, b"{}".to_vec());
        assert!(bus.publish_envelope("orders", &shipped).await.is_err());

        let first = bounded(Duration::from_secs(3), results.next()).await.unwrap().unwrap();
        assert!(first.success);
        assert_eq!(first.event_id, created.event_id);
        assert_eq!(first.aggregate_id, "order-7");

        let second = bounded(Duration::from_secs(3), results.next()).await.unwrap().unwrap();
        assert!(!second.success);
        assert_eq!(second.event_type, "OrderShipped");
        assert!(second.error.is_some());
        assert_eq!(bus.metrics().connection_errors, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rate_limit_throttles_consumption() {
        let mut config = test_config();
        config.rate_limit.enabled = true;
        config.rate_limit.rate_per_second = 50.0;
        config.rate_limit.burst_size = 5;
        let (bus, _transport) = memory_bus(config);
        let handled = Arc::new(AtomicU64::new(0));
        bus.subscribe_envelope("orders", counting(handled.clone()))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        for version in 1..=30 {
            let envelope = Envelope::new("order-1", "OrderUpdated", version, b"{}".to_vec());
            bus.publish_envelope("orders", &envelope).await.unwrap();
        }
        wait_until(Duration::from_secs(5), || handled.load(Ordering::SeqCst) == 30).await;
        // 25 deliveries past the burst at 50/s.
        assert!(started.elapsed() >= Duration::from_millis(400));

        bus.set_rate_limit(200.0);
        let stats = bus.rate_limiter_stats();
        assert!(stats.enabled);
        assert!((stats.rate_per_second - 200.0).abs() < f64::EPSILON);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_builds_memory_bus_from_config() {
        let bus = EventBus::new(test_config()).await.unwrap();
        assert_eq!(bus.transport().kind(), TransportKind::Memory);
        assert!(bus.supports_envelopes());
        assert!(bus.get_connection_state().is_connected);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let mut config = test_config();
        config.worker_pool.worker_count = 0;
        assert!(matches!(
            EventBus::new(config).await,
            Err(BusError::Config(_))
        ));

        let mut config = EventBusConfig::default();
        config.transport = TransportKind::Kafka;
        config.kafka.brokers.clear();
        assert!(matches!(
            EventBus::new(config).await,
            Err(BusError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_nats_fails_construction() {
        let mut config = test_config();
        config.transport = TransportKind::Nats;
        config.nats.urls = vec!["nats://127.0.0.1:1".to_string()];
        let built = bounded(Duration::from_secs(10), EventBus::new(config)).await;
        assert!(matches!(built, Err(BusError::Transport(_))));
    }

    #[test]
    fn test_logging_installs_once() {
        let config = TelemetryConfig::from_lookup(|key| match key {
            "BUS_CONSOLE_OUTPUT" => Some("false".to_string()),
            "BUS_LOG_LEVEL" => Some("event_bus=debug,warn".to_string()),
            _ => None,
        })
        .with_service_name("bus-tests");
        assert!(!config.console_output);

        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_err());
    }
}

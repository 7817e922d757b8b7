//! # Backlog Transitions
//!
//! A consumer that stalls, a queue that grows, and detectors that speak up
//! exactly twice: when the backlog appears and when it clears.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bus_types::{BacklogSeverity, BacklogState, PublisherBacklogState};
    use event_bus::backlog::TransportLagSource;
    use event_bus::transport::Completion;
    use event_bus::{
        Delivery, DeliveryHandler, MemoryTransport, OutboundMessage, SubscriberBacklogConfig,
        SubscriberBacklogDetector, Transport,
    };
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use tokio::sync::Semaphore;

    use crate::fixtures::{memory_bus, test_config, wait_until};

    /// Dispatch blocks until the gate hands out a permit.
    fn gated_handler(gate: Arc<Semaphore>) -> DeliveryHandler {
        Arc::new(move |_delivery: Delivery| -> BoxFuture<'static, Completion> {
            let gate = gate.clone();
            async move {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                async { Ok(()) }.boxed()
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_consumer_lag_enters_and_leaves_backlog() {
        let transport = Arc::new(MemoryTransport::new());
        let gate = Arc::new(Semaphore::new(0));
        transport
            .subscribe("orders", "test", gated_handler(gate.clone()))
            .await
            .unwrap();

        let detector = SubscriberBacklogDetector::new(
            SubscriberBacklogConfig {
                max_lag_threshold: 10,
                ..SubscriberBacklogConfig::default()
            },
            Arc::new(TransportLagSource(transport.clone())),
        );
        detector.watch_topic("orders");

        let reported: Arc<Mutex<Vec<BacklogState>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = reported.clone();
        detector.callbacks().register(move |state: BacklogState| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().push(state);
                Ok(())
            }
        });

        assert!(detector.check_once().await.is_empty());

        for _ in 0..30 {
            transport
                .publish("orders", OutboundMessage::new(b"{}".to_vec()))
                .await
                .unwrap();
        }
        let entered = detector.check_once().await;
        assert_eq!(entered.len(), 1);
        assert!(entered[0].has_backlog);
        assert!(entered[0].lag_count > 10);
        assert!(detector.check_once().await.is_empty());

        gate.add_permits(30);
        wait_until(Duration::from_secs(3), || transport.delivered_count() == 30).await;
        let cleared = detector.check_once().await;
        assert_eq!(cleared.len(), 1);
        assert!(!cleared[0].has_backlog);
        assert_eq!(cleared[0].lag_count, 0);

        let reported = reported.lock();
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].consumer_group, "memory");
    }

    #[tokio::test]
    async fn test_publisher_queue_depth_reported_through_bus() {
        let mut config = test_config();
        config.publisher_backlog.enabled = true;
        config.publisher_backlog.max_queue_depth = 100;
        config.publisher_backlog.rate_threshold = 0.0;
        config.publisher_backlog.check_interval = Duration::from_millis(20);
        let (bus, _transport) = memory_bus(config);

        let reported: Arc<Mutex<Vec<PublisherBacklogState>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = reported.clone();
        bus.register_publisher_backlog_callback(move |state| {
            recorder.lock().push(state);
            async { Ok(()) }
        });
        bus.start().await.unwrap();

        bus.update_publisher_queue_depth(95);
        wait_until(Duration::from_secs(3), || {
            reported.lock().iter().any(|s| s.severity == BacklogSeverity::Critical)
        })
        .await;
        bus.update_publisher_queue_depth(150);
        wait_until(Duration::from_secs(3), || reported.lock().iter().any(|s| s.has_backlog)).await;
        bus.update_publisher_queue_depth(0);
        wait_until(Duration::from_secs(3), || {
            reported.lock().last().is_some_and(|s| s.severity == BacklogSeverity::Normal)
        })
        .await;
        bus.close().await.unwrap();

        let reported = reported.lock();
        let backlogged = reported.iter().filter(|s| s.has_backlog).count();
        assert_eq!(backlogged, 1);
        assert!(!reported.last().unwrap().has_backlog);
    }

    #[tokio::test]
    async fn test_publish_latency_feeds_publisher_detector() {
        let (bus, _transport) = memory_bus(test_config());
        for _ in 0..5 {
            bus.publish("audit", b"{}".to_vec()).await.unwrap();
        }
        let state = bus.publisher_backlog_state();
        assert!(state.publish_rate > 0.0);
        assert!(!state.has_backlog);
        assert_eq!(bus.metrics().messages_published, 5);
    }

    #[tokio::test]
    async fn test_bus_watches_subscribed_topics() {
        let mut config = test_config();
        config.subscriber_backlog.enabled = true;
        config.subscriber_backlog.check_interval = Duration::from_millis(20);
        let (bus, _transport) = memory_bus(config);

        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        bus.register_backlog_callback(move |_state| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
        bus.subscribe("orders", |_| async { Ok(()) }).await.unwrap();
        bus.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.close().await.unwrap();

        // An idle consumer never crosses the threshold.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}

//! # Reconnect and Subscription Replay
//!
//! A transport that refuses the first reconnect attempts, a broker that
//! drops every subscription on disconnect, and a facade that has to put
//! them all back.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bus_types::{BusError, Envelope, HealthState};
    use event_bus::{EventBus, MemoryTransport, Transport};

    use crate::fixtures::{test_config, wait_until, FlakyTransport};

    fn flaky_bus(failing_reconnects: u32) -> (EventBus, Arc<FlakyTransport>, Arc<MemoryTransport>) {
        let memory = Arc::new(MemoryTransport::new());
        let flaky = Arc::new(FlakyTransport::new(memory.clone(), failing_reconnects));
        let bus = EventBus::with_transport(test_config(), flaky.clone()).unwrap();
        (bus, flaky, memory)
    }

    fn count_reconnects(bus: &EventBus) -> Arc<AtomicU64> {
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        bus.register_reconnect_callback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        fired
    }

    #[tokio::test]
    async fn test_replay_after_failed_attempts() {
        let (bus, flaky, memory) = flaky_bus(2);
        let raw = Arc::new(AtomicU64::new(0));
        let envelopes = Arc::new(AtomicU64::new(0));
        {
            let raw = raw.clone();
            bus.subscribe("audit", move |_| {
                let raw = raw.clone();
                async move {
                    raw.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
            let envelopes = envelopes.clone();
            bus.subscribe_envelope("orders", move |_| {
                let envelopes = envelopes.clone();
                async move {
                    envelopes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
        }
        let fired = count_reconnects(&bus);

        flaky.disconnect();
        assert_eq!(memory.subscription_count(), 0);
        assert!(bus.publish("audit", b"{}".to_vec()).await.is_err());

        bus.reconnect().await.unwrap();
        assert_eq!(flaky.reconnect_calls(), 3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(memory.subscription_count(), 2);

        let status = bus.reconnect_status();
        assert_eq!(status.failure_count, 0);
        assert!(!status.is_reconnecting);
        assert!(status.last_reconnect_time.is_some());

        bus.publish("audit", b"{}".to_vec()).await.unwrap();
        let envelope = Envelope::new("order-1", "Created", 1, b"{}".to_vec());
        bus.publish_envelope("orders", &envelope).await.unwrap();
        wait_until(Duration::from_secs(3), || {
            raw.load(Ordering::SeqCst) == 1 && envelopes.load(Ordering::SeqCst) == 1
        })
        .await;
    }

    #[tokio::test]
    async fn test_exhausted_attempts_mark_terminal_failure() {
        let (bus, flaky, _memory) = flaky_bus(100);
        let fired = count_reconnects(&bus);
        flaky.disconnect();

        let err = bus.reconnect().await.unwrap_err();
        assert!(matches!(err, BusError::ReconnectExhausted { attempts: 5, .. }));
        assert_eq!(flaky.reconnect_calls(), 5);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(bus.reconnect_status().terminal_failed);
        assert_eq!(bus.metrics().connection_errors, 1);
    }

    #[tokio::test]
    async fn test_callbacks_fire_once_per_reconnect() {
        let (bus, flaky, _memory) = flaky_bus(0);
        let fired = count_reconnects(&bus);
        let failing = Arc::new(AtomicU64::new(0));
        let tally = failing.clone();
        bus.register_reconnect_callback(move || {
            tally.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("callback failure is isolated")) }
        });

        for _ in 0..3 {
            flaky.disconnect();
            bus.reconnect().await.unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(failing.load(Ordering::SeqCst), 3);
        assert_eq!(bus.get_connection_state().reconnect_count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_health_checker_triggers_reconnect() {
        let memory = Arc::new(MemoryTransport::new());
        let flaky = Arc::new(FlakyTransport::new(memory.clone(), 1));
        let mut config = test_config();
        config.health_check.enabled = true;
        config.health_check.interval = Duration::from_millis(100);
        config.reconnect.failure_threshold = 2;
        let bus = EventBus::with_transport(config, flaky.clone()).unwrap();

        let delivered = Arc::new(AtomicU64::new(0));
        let counter = delivered.clone();
        bus.subscribe("orders", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        let fired = count_reconnects(&bus);
        bus.start().await.unwrap();

        wait_until(Duration::from_secs(3), || {
            bus.get_health_status().last_success_time.is_some()
        })
        .await;
        flaky.disconnect();

        wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst) == 1).await;
        wait_until(Duration::from_secs(3), || {
            bus.get_health_status().state == HealthState::Healthy
        })
        .await;
        assert_eq!(flaky.reconnect_calls(), 2);
        assert!(bus.get_connection_state().is_connected);

        bus.publish("orders", b"{}".to_vec()).await.unwrap();
        wait_until(Duration::from_secs(3), || delivered.load(Ordering::SeqCst) == 1).await;
        bus.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_reconnects_replay_once() {
        let (bus, flaky, memory) = flaky_bus(0);
        let delivered = Arc::new(AtomicU64::new(0));
        let counter = delivered.clone();
        bus.subscribe("t", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        let fired = count_reconnects(&bus);

        flaky.disconnect();
        let (first, second) = tokio::join!(bus.reconnect(), bus.reconnect());
        first.unwrap();
        second.unwrap();

        assert_eq!(flaky.reconnect_calls(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(memory.subscription_count(), 1);

        bus.publish("t", b"{}".to_vec()).await.unwrap();
        wait_until(Duration::from_secs(3), || delivered.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_after_terminal_failure_clears_it() {
        let memory = Arc::new(MemoryTransport::new());
        let flaky = Arc::new(FlakyTransport::new(memory.clone(), 100));
        let mut config = test_config();
        config.health_check.enabled = true;
        config.health_check.interval = Duration::from_millis(100);
        config.reconnect.failure_threshold = 2;
        config.reconnect.max_attempts = 1;
        let bus = EventBus::with_transport(config, flaky.clone()).unwrap();
        bus.start().await.unwrap();

        wait_until(Duration::from_secs(3), || {
            bus.get_health_status().last_success_time.is_some()
        })
        .await;
        flaky.disconnect();
        wait_until(Duration::from_secs(5), || {
            bus.get_health_status().state == HealthState::Failed
        })
        .await;
        assert!(bus.reconnect_status().terminal_failed);

        // The broker comes back on its own, outside the reconnect loop.
        memory.reconnect().await.unwrap();
        wait_until(Duration::from_secs(3), || {
            bus.get_health_status().state == HealthState::Healthy
        })
        .await;
        let status = bus.reconnect_status();
        assert!(!status.terminal_failed);
        assert_eq!(status.failure_count, 0);
        bus.close().await.unwrap();
    }
}

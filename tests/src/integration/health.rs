//! # Heartbeats
//!
//! One service publishes heartbeats, another watches for them. Both share a
//! memory broker here.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bus_types::{AlertSeverity, HealthCheckAlert, HealthCheckResult, HealthState};
    use event_bus::{EventBus, EventBusConfig, MemoryTransport, Transport};
    use parking_lot::Mutex;

    use crate::fixtures::{test_config, wait_until};

    fn heartbeat_config(service: &str) -> EventBusConfig {
        let mut config = test_config();
        config.service_name = service.to_string();
        config.health_check.interval = Duration::from_millis(100);
        config.health_check.subscriber.monitor_interval = Duration::from_millis(100);
        config.health_check.subscriber.warning_threshold = 1;
        config.health_check.subscriber.error_threshold = 2;
        config.health_check.subscriber.critical_threshold = 3;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_monitor_receives_heartbeats_from_publisher() {
        let broker: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let service = EventBus::with_transport(heartbeat_config("orders-service"), broker.clone()).unwrap();
        let monitor = EventBus::with_transport(heartbeat_config("monitor"), broker).unwrap();

        let results: Arc<Mutex<Vec<HealthCheckResult>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = results.clone();
        service.register_health_check_callback(move |result| {
            recorder.lock().push(result);
            async { Ok(()) }
        });

        monitor.start_health_check_subscriber().await.unwrap();
        service.start_health_check().unwrap();

        wait_until(Duration::from_secs(3), || {
            monitor.health_subscriber_stats().total_messages_received >= 2
        })
        .await;
        let stats = monitor.health_subscriber_stats();
        assert!(stats.is_healthy);
        assert_eq!(stats.consecutive_misses, 0);
        assert!(stats.last_message_time.is_some());

        let status = service.get_health_status();
        assert!(status.is_running);
        assert_eq!(status.state, HealthState::Healthy);
        assert!(results.lock().iter().all(|r| r.success));
        assert!(results.lock().iter().all(|r| r.source == "orders-service"));

        service.stop_all_health_check().await;
        monitor.stop_all_health_check().await;
        assert!(!service.get_health_status().is_running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_silence_escalates_to_critical() {
        let broker: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let monitor = EventBus::with_transport(heartbeat_config("monitor"), broker).unwrap();

        let alerts: Arc<Mutex<Vec<HealthCheckAlert>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = alerts.clone();
        monitor.register_health_alert_callback(move |alert| {
            recorder.lock().push(alert);
            async { Ok(()) }
        });
        monitor.start_health_check_subscriber().await.unwrap();

        wait_until(Duration::from_secs(5), || {
            alerts
                .lock()
                .iter()
                .any(|a| a.severity == AlertSeverity::Critical)
        })
        .await;
        monitor.stop_health_check_subscriber().await;

        let alerts = alerts.lock();
        let severities: Vec<AlertSeverity> = alerts.iter().map(|a| a.severity).collect();
        assert_eq!(
            &severities[..3],
            &[AlertSeverity::Warning, AlertSeverity::Error, AlertSeverity::Critical]
        );
        assert!(alerts.iter().all(|a| a.alert_type == "no_messages"));
        assert!(alerts.iter().all(|a| a.last_message_time.is_none()));
        assert!(!monitor.health_subscriber_stats().is_healthy);
    }

    #[tokio::test]
    async fn test_health_start_twice_is_rejected() {
        let broker: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let bus = EventBus::with_transport(heartbeat_config("svc"), broker).unwrap();
        bus.start_health_check().unwrap();
        assert!(bus.start_health_check().is_err());
        bus.stop_health_check().await;
        bus.start_health_check().unwrap();
        bus.close().await.unwrap();
        assert!(!bus.get_health_status().is_running);
    }
}

//! # Per-Aggregate Ordering
//!
//! Many publishers, many aggregates, one subscription. Every aggregate must
//! see its versions strictly in publish order; different aggregates are free
//! to interleave.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use bus_types::Envelope;
    use event_bus::{extract_aggregate_id, fnv1a_32, worker_index, SubjectPattern};
    use parking_lot::Mutex;
    use rand::Rng;
    use tokio::sync::oneshot;

    use crate::fixtures::{bounded, memory_bus, test_config, wait_until};

    type Seen = Arc<Mutex<HashMap<String, Vec<i64>>>>;

    async fn subscribe_recording(bus: &event_bus::EventBus, topic: &str) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(HashMap::new()));
        let recorder = seen.clone();
        bus.subscribe_envelope(topic, move |envelope: Envelope| {
            let recorder = recorder.clone();
            async move {
                // Jitter so fast and slow handlers overlap across workers.
                let pause = rand::thread_rng().gen_range(0..200);
                tokio::time::sleep(Duration::from_micros(pause)).await;
                recorder
                    .lock()
                    .entry(envelope.aggregate_id)
                    .or_default()
                    .push(envelope.event_version);
                Ok(())
            }
        })
        .await
        .unwrap();
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hot_aggregate_stays_ordered_among_concurrent_publishers() {
        let (bus, _transport) = memory_bus(test_config());
        let seen = subscribe_recording(&bus, "orders").await;

        const VERSIONS: i64 = 100;
        let mut publishers = Vec::new();
        for publisher in 0..10 {
            let bus = bus.clone();
            publishers.push(tokio::spawn(async move {
                let own = format!("order-{publisher}");
                for version in 1..=VERSIONS {
                    let envelope = Envelope::new(own.as_str(), "OrderUpdated", version, b"{}".to_vec());
                    bus.publish_envelope("orders", &envelope).await.unwrap();
                }
            }));
        }
        // order-42 is published by one task interleaved with the others.
        for version in 1..=VERSIONS {
            let envelope = Envelope::new("order-42", "OrderUpdated", version, b"{}".to_vec());
            bus.publish_envelope("orders", &envelope).await.unwrap();
        }
        for publisher in publishers {
            publisher.await.unwrap();
        }

        let expected_total = 11 * usize::try_from(VERSIONS).unwrap();
        wait_until(Duration::from_secs(10), || {
            seen.lock().values().map(Vec::len).sum::<usize>() == expected_total
        })
        .await;

        let expected: Vec<i64> = (1..=VERSIONS).collect();
        for (aggregate, versions) in seen.lock().iter() {
            assert_eq!(versions, &expected, "{aggregate} out of order");
        }
        assert_eq!(seen.lock().get("order-42").map(Vec::len), Some(100));

        bounded(Duration::from_secs(5), bus.close()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_aggregate_handed_between_publishing_tasks_stays_ordered() {
        let (bus, _transport) = memory_bus(test_config());
        let seen = subscribe_recording(&bus, "orders").await;

        // Task n publishes versions 10n+1..=10n+10, then hands off to n+1.
        let (first_tx, mut turn) = oneshot::channel::<()>();
        let mut tasks = Vec::new();
        for owner in 0..10i64 {
            let (next_tx, next_rx) = oneshot::channel::<()>();
            let bus = bus.clone();
            let my_turn = std::mem::replace(&mut turn, next_rx);
            tasks.push(tokio::spawn(async move {
                my_turn.await.unwrap();
                for version in owner * 10 + 1..=owner * 10 + 10 {
                    let envelope = Envelope::new("order-42", "OrderUpdated", version, b"{}".to_vec());
                    bus.publish_envelope("orders", &envelope).await.unwrap();
                }
                let _ = next_tx.send(());
            }));
        }
        first_tx.send(()).unwrap();
        for task in tasks {
            bounded(Duration::from_secs(10), task).await.unwrap();
        }

        wait_until(Duration::from_secs(10), || {
            seen.lock().get("order-42").map_or(0, Vec::len) == 100
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            seen.lock().get("order-42").cloned(),
            Some((1..=100).collect::<Vec<i64>>())
        );
        assert_eq!(seen.lock().len(), 1);
        bounded(Duration::from_secs(5), bus.close()).await.unwrap();
    }

    #[tokio::test]
    async fn test_one_aggregate_always_uses_one_worker() {
        let (bus, _transport) = memory_bus(test_config());
        let seen = subscribe_recording(&bus, "orders").await;

        for version in 1..=40 {
            let envelope = Envelope::new("order-42", "OrderUpdated", version, b"{}".to_vec());
            bus.publish_envelope("orders", &envelope).await.unwrap();
        }
        wait_until(Duration::from_secs(5), || {
            seen.lock().get("order-42").map_or(0, Vec::len) == 40
        })
        .await;

        wait_until(Duration::from_secs(5), || {
            bus.worker_stats().iter().map(|s| s.processed).sum::<u64>() == 40
        })
        .await;
        let busy: Vec<(usize, u64)> = bus
            .worker_stats()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.processed > 0)
            .map(|(worker, s)| (worker, s.processed))
            .collect();
        assert_eq!(busy, vec![(worker_index("order-42", 8), 40)]);
    }

    #[test]
    fn test_routing_hash_is_fnv1a() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(worker_index("order-42", 8), worker_index("order-42", 8));
        assert!(worker_index("order-42", 8) < 8);
    }

    #[test]
    fn test_extraction_priority() {
        let envelope = Envelope::new("from-envelope", "Created", 1, b"{}".to_vec());
        let bytes = envelope.to_bytes().unwrap();
        let mut headers = HashMap::new();
        headers.insert("X-Aggregate-ID".to_string(), "from-header".to_string());
        let pattern = SubjectPattern::default();

        let id = extract_aggregate_id(&bytes, &headers, Some("from-key"), Some("orders.from-subject"), pattern);
        assert_eq!(id.unwrap(), "from-envelope");

        let id = extract_aggregate_id(b"{}", &headers, Some("from-key"), Some("orders.from-subject"), pattern);
        assert_eq!(id.unwrap(), "from-header");

        let id = extract_aggregate_id(b"{}", &HashMap::new(), Some("from-key"), Some("orders.from-subject"), pattern);
        assert_eq!(id.unwrap(), "from-key");

        let id = extract_aggregate_id(b"{}", &HashMap::new(), None, Some("orders.from-subject"), pattern);
        assert_eq!(id.unwrap(), "from-subject");

        let id = extract_aggregate_id(b"{}", &HashMap::new(), None, Some("orders"), SubjectPattern::Disabled);
        assert!(id.is_err());
    }
}

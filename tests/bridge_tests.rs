/// Bridge loop tests against in-process fakes
///
/// These tests drive the whole forwarding path:
/// - Queue pull → decode/tag → batch → stream → ack
/// - Per-record acceptance and redelivery of failures
/// - Drain-mode termination and fatal shutdown
mod common;

use common::{FakeQueue, RecordingSink};
use pubsub2oci::bridge::{Bridge, BridgeError, BridgeSettings};
use pubsub2oci::sender::{BatchLimits, SenderSettings};
use pubsub2oci::session::{BridgeSession, BridgeState, RunMode};
use pubsub2oci::source::{PullError, SubscriberSettings};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_LEASE: Duration = Duration::from_secs(3600);

    fn subscriber_settings(max_concurrency: usize) -> SubscriberSettings {
        SubscriberSettings {
            max_concurrency,
            ..Default::default()
        }
    }

    fn sender_settings(max_records: usize) -> SenderSettings {
        SenderSettings {
            limits: BatchLimits {
                max_records,
                max_bytes: 1024 * 1024,
            },
            flush_interval: None,
            max_attempts: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            max_pending_batches: 4,
        }
    }

    fn bridge(
        queue: &Arc<FakeQueue>,
        sink: &Arc<RecordingSink>,
        mode: RunMode,
        subscriber: SubscriberSettings,
        sender: SenderSettings,
    ) -> Bridge {
        Bridge::new(
            queue.clone(),
            subscriber,
            sink.clone(),
            sender,
            BridgeSettings::default(),
            Arc::new(BridgeSession::new(mode)),
        )
    }

    /// Helper: publish `count` small JSON log entries
    fn publish_logs(queue: &FakeQueue, count: usize) -> Vec<String> {
        (1..=count)
            .map(|n| queue.publish_json(&json!({"severity": "INFO", "textPayload": format!("line {n}")})))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_records_one_batch() {
        let queue = Arc::new(FakeQueue::new(LONG_LEASE));
        let sink = Arc::new(RecordingSink::new());
        let ids = publish_logs(&queue, 5);

        let bridge = bridge(&queue, &sink, RunMode::Drain, subscriber_settings(4), sender_settings(100));
        let summary = bridge.run(std::future::pending()).await.unwrap();

        assert_eq!(summary.processed, 5);
        assert_eq!(summary.sent, 5);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(sink.batch_sizes(), vec![5]);

        let mut acked = queue.acked_ids();
        acked.sort();
        let mut expected = ids;
        expected.sort();
        assert_eq!(acked, expected);
        assert_eq!(bridge.session().state(), BridgeState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_150_records_split_at_batch_size() {
        let queue = Arc::new(FakeQueue::new(LONG_LEASE));
        let sink = Arc::new(RecordingSink::new());
        publish_logs(&queue, 150);

        let bridge = bridge(&queue, &sink, RunMode::Drain, subscriber_settings(100), sender_settings(100));
        let summary = bridge.run(std::future::pending()).await.unwrap();

        assert_eq!(sink.batch_sizes(), vec![100, 50]);
        assert_eq!(summary.processed, 150);
        assert_eq!(summary.sent, 150);
        assert_eq!(summary.batches, 2);
        assert!(queue.unacked_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_record_is_the_only_one_left_unacked() {
        let queue = Arc::new(FakeQueue::new(LONG_LEASE));
        let sink = Arc::new(RecordingSink::new());
        publish_logs(&queue, 5);
        sink.reject_key("msg-3", u32::MAX);

        let bridge = bridge(&queue, &sink, RunMode::Drain, subscriber_settings(1), sender_settings(100));
        let summary = bridge.run(std::future::pending()).await.unwrap();

        assert_eq!(summary.processed, 5);
        assert_eq!(summary.sent, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(queue.unacked_ids(), vec!["msg-3".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_sink_acks_nothing() {
        let queue = Arc::new(FakeQueue::new(LONG_LEASE));
        let sink = Arc::new(RecordingSink::failing(503));
        publish_logs(&queue, 5);

        let bridge = bridge(&queue, &sink, RunMode::Drain, subscriber_settings(4), sender_settings(100));
        let summary = bridge.run(std::future::pending()).await.unwrap();

        assert_eq!(summary.processed, 5);
        assert_eq!(summary.sent, 0);
        assert_eq!(summary.failed, 5);
        assert_eq!(summary.batches, 0);
        assert_eq!(summary.exit_code(), 5);
        // One batch, retried once.
        assert_eq!(sink.calls(), 2);
        assert!(queue.acked_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_redelivered_and_forwarded() {
        let queue = Arc::new(FakeQueue::new(Duration::from_secs(5)));
        let sink = Arc::new(RecordingSink::new());
        let ids = publish_logs(&queue, 5);
        // Rejected outright, not retried: the records wait for redelivery.
        sink.fail_next(400);

        let bridge = bridge(&queue, &sink, RunMode::Drain, subscriber_settings(4), sender_settings(5));
        let summary = bridge.run(std::future::pending()).await.unwrap();

        assert_eq!(summary.failed, 5);
        assert_eq!(summary.sent, 5);
        assert_eq!(summary.processed, 10);
        assert!(queue.unacked_ids().is_empty());
        for id in &ids {
            assert_eq!(queue.deliveries(id), 2, "{id}");
        }

        let mut keys = sink.submitted_keys();
        keys.sort();
        let mut expected = ids;
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_tag_injected() {
        let queue = Arc::new(FakeQueue::new(LONG_LEASE));
        let sink = Arc::new(RecordingSink::new());
        queue.publish_json(&json!({"logName": "projects/p/logs/syslog", "textPayload": "boot"}));
        queue.publish_json(&json!(["not", "an", "object"]));

        let bridge = bridge(&queue, &sink, RunMode::Drain, subscriber_settings(1), sender_settings(100));
        bridge.run(std::future::pending()).await.unwrap();

        let values = sink.submitted_values();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&json!({
            "logName": "projects/p/logs/syslog",
            "textPayload": "boot",
            "cloudProvider": "GCP"
        })));
        assert!(values.contains(&json!({
            "data": ["not", "an", "object"],
            "cloudProvider": "GCP"
        })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_stops_after_inactivity_with_one_flush() {
        let queue = Arc::new(FakeQueue::new(LONG_LEASE));
        let sink = Arc::new(RecordingSink::new());
        publish_logs(&queue, 5);

        let bridge = bridge(&queue, &sink, RunMode::Drain, subscriber_settings(4), sender_settings(100));
        let started = tokio::time::Instant::now();
        let summary = bridge.run(std::future::pending()).await.unwrap();
        let elapsed = started.elapsed();

        let timeout = BridgeSettings::default().inactivity_timeout;
        assert!(elapsed >= timeout, "stopped early after {elapsed:?}");
        assert!(elapsed <= timeout + Duration::from_secs(2), "stopped late after {elapsed:?}");
        assert_eq!(bridge.sender().flush_calls(), 1);
        assert_eq!(summary.sent, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_and_empty_messages() {
        let queue = Arc::new(FakeQueue::new(LONG_LEASE));
        let sink = Arc::new(RecordingSink::new());
        let bad = queue.publish_raw("{not json");
        let empty = queue.publish_raw("  \n");
        let good = queue.publish_json(&json!({"textPayload": "ok"}));

        let bridge = bridge(&queue, &sink, RunMode::Continuous, subscriber_settings(1), sender_settings(100));
        let summary = bridge
            .run(tokio::time::sleep(Duration::from_secs(3)))
            .await
            .unwrap();

        // Nacked input is redelivered and counted again on each delivery.
        assert!(summary.errors >= 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(queue.unacked_ids(), vec![bad]);
        assert!(queue.acked_ids().contains(&empty));
        assert!(queue.acked_ids().contains(&good));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_stops_despite_malformed_redeliveries() {
        let queue = Arc::new(FakeQueue::new(LONG_LEASE));
        let sink = Arc::new(RecordingSink::new());
        let good = queue.publish_json(&json!({"textPayload": "ok"}));
        let bad = queue.publish_raw("{not json");

        let bridge = bridge(&queue, &sink, RunMode::Drain, subscriber_settings(4), sender_settings(100));
        let started = tokio::time::Instant::now();
        let summary = tokio::time::timeout(Duration::from_secs(600), bridge.run(std::future::pending()))
            .await
            .expect("drain run should end while a malformed message keeps being redelivered")
            .unwrap();
        let elapsed = started.elapsed();

        let timeout = BridgeSettings::default().inactivity_timeout;
        assert!(elapsed <= timeout + Duration::from_secs(2), "stopped late after {elapsed:?}");
        assert!(queue.deliveries(&bad) > 1);
        assert!(summary.errors > 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(queue.acked_ids(), vec![good]);
        assert_eq!(queue.unacked_ids(), vec![bad]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_stops_despite_rejected_redeliveries() {
        let queue = Arc::new(FakeQueue::new(Duration::from_secs(2)));
        let sink = Arc::new(RecordingSink::new());
        let ids = publish_logs(&queue, 2);
        sink.reject_key(&ids[1], u32::MAX);

        let mut sender = sender_settings(100);
        sender.flush_interval = Some(Duration::from_secs(1));
        let bridge = bridge(&queue, &sink, RunMode::Drain, subscriber_settings(4), sender);
        let started = tokio::time::Instant::now();
        let summary = tokio::time::timeout(Duration::from_secs(600), bridge.run(std::future::pending()))
            .await
            .expect("drain run should end while a rejected record keeps being redelivered")
            .unwrap();

        // Last progress is the first flush, about a second in.
        let timeout = BridgeSettings::default().inactivity_timeout;
        assert!(started.elapsed() <= timeout + Duration::from_secs(4));
        assert!(queue.deliveries(&ids[1]) > 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(queue.unacked_ids(), vec![ids[1].clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_failure_still_flushes_buffered_records() {
        let queue = Arc::new(FakeQueue::new(LONG_LEASE));
        let sink = Arc::new(RecordingSink::new());
        let ids = publish_logs(&queue, 3);

        let failing = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            failing.fail_next_pull(PullError::Status {
                status: 403,
                message: "PERMISSION_DENIED".to_string(),
            });
        });

        let bridge = bridge(&queue, &sink, RunMode::Continuous, subscriber_settings(4), sender_settings(100));
        let err = bridge.run(std::future::pending()).await.unwrap_err();

        assert!(err.to_string().contains("source"), "{err}");
        assert_eq!(sink.batch_sizes(), vec![3]);
        let summary = bridge.session().summary();
        assert_eq!(summary.sent, 3);
        assert_eq!(summary.failed, 0);

        let mut acked = queue.acked_ids();
        acked.sort();
        assert_eq!(acked, ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_stream_is_fatal() {
        let queue = Arc::new(FakeQueue::new(LONG_LEASE));
        let sink = Arc::new(RecordingSink::failing(401));
        publish_logs(&queue, 3);

        let bridge = bridge(&queue, &sink, RunMode::Continuous, subscriber_settings(4), sender_settings(3));
        let result = bridge.run(std::future::pending()).await;

        match result {
            Err(e @ BridgeError::Fatal { .. }) => {
                assert!(e.to_string().contains("401"), "{e}");
                assert_eq!(e.exit_code(), 3);
            }
            other => panic!("expected fatal error, got {other:?}"),
        }
        // Not retried.
        assert_eq!(sink.calls(), 1);
        assert!(queue.acked_ids().is_empty());
        assert_eq!(bridge.session().summary().failed, 3);
        assert_eq!(bridge.session().state(), BridgeState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_pull_is_fatal() {
        let queue = Arc::new(FakeQueue::new(LONG_LEASE));
        let sink = Arc::new(RecordingSink::new());
        queue.fail_next_pull(PullError::Status {
            status: 403,
            message: "PERMISSION_DENIED".to_string(),
        });

        let bridge = bridge(&queue, &sink, RunMode::Continuous, subscriber_settings(4), sender_settings(100));
        let result = bridge.run(std::future::pending()).await;

        let err = result.unwrap_err();
        assert!(matches!(err, BridgeError::Fatal { .. }));
        // Nothing failed, but a fatal stop still exits non-zero.
        assert_eq!(err.exit_code(), 1);
        assert_eq!(queue.pull_count(), 1);
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialized_and_concurrent_delivery_agree() {
        for concurrency in [1, 4] {
            let queue = Arc::new(FakeQueue::new(LONG_LEASE));
            let sink = Arc::new(RecordingSink::new());
            publish_logs(&queue, 40);

            let bridge = bridge(
                &queue,
                &sink,
                RunMode::Drain,
                subscriber_settings(concurrency),
                sender_settings(10),
            );
            let summary = bridge.run(std::future::pending()).await.unwrap();

            assert_eq!(summary.sent, 40, "concurrency {concurrency}");
            assert_eq!(summary.batches, 4, "concurrency {concurrency}");
            assert_eq!(sink.batch_sizes(), vec![10; 4]);
            assert!(queue.unacked_ids().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signal_drains_buffer() {
        let queue = Arc::new(FakeQueue::new(LONG_LEASE));
        let sink = Arc::new(RecordingSink::new());
        publish_logs(&queue, 7);

        let bridge = bridge(&queue, &sink, RunMode::Continuous, subscriber_settings(4), sender_settings(100));
        let summary = bridge
            .run(tokio::time::sleep(Duration::from_secs(2)))
            .await
            .unwrap();

        assert_eq!(summary.sent, 7);
        assert_eq!(sink.batch_sizes(), vec![7]);
        assert_eq!(queue.acked_ids().len(), 7);
    }
}

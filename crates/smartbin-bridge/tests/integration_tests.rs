//! Integration tests for the smart-bin telemetry bridge
//!
//! These tests drive the whole pipeline end to end:
//! - Serial bytes through the decoder, parser and queue into the database
//! - Detection logging and bin state merging
//! - Malformed and invalid frames mixed with good ones
//! - Remote failures, retries and shutdown draining

use serde_json::json;
use smartbin_bridge::test_utils::{detection, frame};
use smartbin_bridge::{
    BridgeReport, DeliveryQueue, EnqueueOutcome, FailureKind, FlakyDatabase, FrameDecoder,
    MemoryDatabase, MockSerialLink, OverflowPolicy, RemoteDatabase, TelemetryBridge,
    TelemetryConfig, TelemetryConfigBuilder, TelemetryReading, DEFAULT_FRAME_PREFIX, VERSION,
};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn test_config() -> TelemetryConfig {
    TelemetryConfigBuilder::new()
        .settle_delay(Duration::ZERO)
        .jitter(false)
        .build()
}

/// Start the bridge, wait for the scripted traffic to be read, then stop it
async fn run_bridge<D: RemoteDatabase + 'static>(
    link: MockSerialLink,
    database: D,
    config: TelemetryConfig,
) -> BridgeReport {
    let observer = link.clone();
    let (bridge, handle) = TelemetryBridge::new(link, database, config);
    let task = tokio::spawn(bridge.run());

    while !observer.is_drained() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.shutdown();

    task.await
        .expect("bridge task panicked")
        .expect("bridge returned an error")
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_plastic_detection_end_to_end() {
    let link = MockSerialLink::new();
    link.push_line(r#"ARDUINO_DATA:{"materialDetected":"Plastic","plastic":{"status":"clean"}}"#);

    let db = Arc::new(MemoryDatabase::new());
    let before = chrono::Utc::now();
    let report = run_bridge(link, db.clone(), test_config()).await;

    let logs = db.log_entries("bin1/logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].material, "Plastic");
    assert_eq!(logs[0].status, "clean");
    assert!(logs[0].time >= before);

    assert_eq!(db.get("bin1/plastic/status"), Some(json!("clean")));
    assert!(db.get("bin1/materialDetected").is_none());
    assert_eq!(report.publish.log_entries, 1);
    assert_eq!(report.publish.state_updates, 1);
}

#[tokio::test(start_paused = true)]
async fn test_none_reading_only_updates_state() {
    let link = MockSerialLink::new();
    link.push_line(r#"ARDUINO_DATA:{"materialDetected":"None"}"#);

    let db = Arc::new(MemoryDatabase::new());
    let report = run_bridge(link, db.clone(), test_config()).await;

    assert!(db.log_entries("bin1/logs").is_empty());
    assert!(db.get("bin1/materialDetected").is_none());
    assert_eq!(report.publish.state_updates, 1);
    assert_eq!(report.publish.log_entries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_skipped_and_loop_continues() {
    let link = MockSerialLink::new();
    link.push_line(r#"ARDUINO_DATA:{"materialDetected":"Metal","metal":"#);
    link.push_bytes(frame(&detection("Metal", "Full")));

    let db = Arc::new(MemoryDatabase::new());
    let report = run_bridge(link, db.clone(), test_config()).await;

    assert_eq!(report.ingest.malformed_frames, 1);
    assert_eq!(report.ingest.readings, 1);
    assert_eq!(report.queue.enqueued, 1);
    assert_eq!(db.log_entries("bin1/logs").len(), 1);
    assert_eq!(db.get("bin1/metal/status"), Some(json!("Full")));
}

#[tokio::test(start_paused = true)]
async fn test_three_transient_failures_then_success() {
    let link = MockSerialLink::new();
    link.push_bytes(frame(&detection("Plastic", "Half")));

    let db = Arc::new(FlakyDatabase::new(MemoryDatabase::new()));
    db.fail_next_appends(3, FailureKind::Transient);
    let report = run_bridge(link, db.clone(), test_config()).await;

    assert_eq!(report.publish.retries, 3);
    assert_eq!(report.publish.acked, 1);
    assert_eq!(db.inner().log_entries("bin1/logs").len(), 1);
    assert_eq!(db.inner().get("bin1/plastic/status"), Some(json!("Half")));
    assert_eq!(db.merge_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_drops_and_continues() {
    let link = MockSerialLink::new();
    link.push_bytes(frame(&json!({ "materialDetected": "None", "sequence": 1 })));
    link.push_bytes(frame(&json!({ "materialDetected": "None", "sequence": 2 })));

    let db = Arc::new(FlakyDatabase::new(MemoryDatabase::new()));
    db.fail_next_merges(1, FailureKind::Permanent);
    let report = run_bridge(link, db.clone(), test_config()).await;

    assert_eq!(report.publish.dropped_permanent, 1);
    assert_eq!(report.publish.acked, 1);
    assert_eq!(db.inner().get("bin1/sequence"), Some(json!(2)));
}

#[tokio::test(start_paused = true)]
async fn test_noisy_fragmented_stream() {
    let stream = format!(
        "Servo ready\r\n{p}{a}\nsensor: 12cm\n{p}{b}\n",
        p = DEFAULT_FRAME_PREFIX,
        a = json!({ "materialDetected": "None", "n": 1 }),
        b = json!({ "materialDetected": "None", "n": 2 }),
    );

    // Deliver the stream a few bytes at a time
    let link = MockSerialLink::new();
    for chunk in stream.as_bytes().chunks(7) {
        link.push_bytes(chunk.to_vec());
    }

    let db = Arc::new(MemoryDatabase::new());
    let report = run_bridge(link, db.clone(), test_config()).await;

    assert_eq!(report.decoder.frames, 2);
    assert_eq!(report.decoder.noise_lines, 2);
    assert_eq!(db.get("bin1/n"), Some(json!(2)));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_unplug() {
    let link = MockSerialLink::new();
    link.push_bytes(frame(&json!({ "materialDetected": "None", "n": 1 })));
    link.push_disconnect();
    link.push_bytes(frame(&json!({ "materialDetected": "None", "n": 2 })));
    let observer = link.clone();

    let db = Arc::new(MemoryDatabase::new());
    let report = run_bridge(link, db.clone(), test_config()).await;

    assert_eq!(report.ingest.link_errors, 1);
    assert_eq!(report.ingest.connects, 2);
    assert_eq!(observer.disconnect_calls(), 2);
    assert_eq!(db.get("bin1/n"), Some(json!(2)));
}

#[tokio::test(start_paused = true)]
async fn test_drop_oldest_under_slow_uplink() {
    let link = MockSerialLink::new();
    for n in 0..6 {
        link.push_bytes(frame(&json!({ "materialDetected": "None", "n": n })));
    }

    let db = Arc::new(FlakyDatabase::new(MemoryDatabase::new()));
    db.stall_next_merges(1, Duration::from_secs(2));
    let config = TelemetryConfigBuilder::new()
        .settle_delay(Duration::ZERO)
        .jitter(false)
        .queue_capacity(2)
        .overflow_policy(OverflowPolicy::DropOldest)
        .build();

    let report = run_bridge(link, db.clone(), config).await;

    // At most one reading is in flight and two wait in the queue
    assert!(report.ingest.overflow_drops >= 3);
    assert_eq!(report.ingest.overflow_drops + report.publish.acked, 6);
    // The newest reading is never the one evicted
    assert_eq!(db.inner().get("bin1/n"), Some(json!(5)));
}

// ============================================================================
// Component properties
// ============================================================================

#[test]
fn test_decoded_reading_equals_source_json() {
    let source = json!({
        "materialDetected": "Metal",
        "metal": { "status": "Full", "level": 97 },
        "plastic": { "status": "Empty", "level": 4 },
    });

    let mut decoder = FrameDecoder::new(DEFAULT_FRAME_PREFIX, 4096);
    decoder.push(&frame(&source));
    let payload = decoder.next_frame().unwrap();
    let reading = TelemetryReading::parse(&payload).unwrap();

    assert_eq!(reading.to_wire(), source);
}

#[test]
fn test_state_update_strips_only_material() {
    let reading = TelemetryReading::parse(
        r#"{"materialDetected":"Plastic","plastic":{"status":"clean"},"uptime":12}"#,
    )
    .unwrap();
    let update = reading.state_update();

    assert!(!update.fields().contains_key("materialDetected"));
    assert_eq!(update.fields().get("uptime"), Some(&json!(12)));
    assert_eq!(update.fields().get("plastic"), Some(&json!({ "status": "clean" })));
}

#[tokio::test]
async fn test_state_merge_is_idempotent() {
    let db = MemoryDatabase::new();
    let reading =
        TelemetryReading::parse(r#"{"materialDetected":"None","metal":{"level":40}}"#).unwrap();
    let update = reading.state_update();

    db.merge_update("bin1", update.fields()).await.unwrap();
    let once = db.snapshot();
    db.merge_update("bin1", update.fields()).await.unwrap();
    assert_eq!(db.snapshot(), once);
}

#[tokio::test]
async fn test_queue_overflow_keeps_most_recent() {
    let queue = DeliveryQueue::new(3, OverflowPolicy::DropOldest);
    for n in 0..4 {
        queue.enqueue(n).await.unwrap();
    }

    assert_eq!(queue.stats().dropped, 1);
    assert_eq!(queue.try_dequeue(), Some(1));
    assert_eq!(queue.try_dequeue(), Some(2));
    assert_eq!(queue.try_dequeue(), Some(3));
    assert!(matches!(queue.enqueue(4).await, Ok(EnqueueOutcome::Accepted)));
}

#[test]
fn test_config_from_json() {
    let config = TelemetryConfig::from_json_str(
        r#"{
            "serial": { "port": "/dev/ttyUSB0", "baud_rate": 9600 },
            "queue": { "capacity": 8, "overflow": "block" },
            "uplink": { "bin_id": "bin7", "retry": { "base_delay": "100ms", "max_retries": 4 } }
        }"#,
    )
    .unwrap();

    assert_eq!(config.queue.overflow, OverflowPolicy::Block);
    assert_eq!(config.uplink.logs_path(), "bin7/logs");
    assert_eq!(config.uplink.retry.base_delay, Duration::from_millis(100));
    assert_eq!(config.uplink.retry.max_retries, Some(4));
    assert_eq!(config.frame.prefix, DEFAULT_FRAME_PREFIX);
}

#[test]
fn test_version_info() {
    assert!(!VERSION.is_empty());
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use ace_link::device::DeviceError;
use ace_link::AceDriver;
use common::{test_config, wait_until, FakeAce};

#[tokio::test]
async fn late_reply_is_discarded_as_orphan() {
    let fake = FakeAce::new();
    fake.with(|s| {
        s.delays.insert("feed_filament".into(), Duration::from_millis(500));
    });
    let driver = AceDriver::with_connector(test_config(), fake.connector());
    driver.connect().await.expect("connect");

    match driver.feed(0, 50, Some(30)).await {
        Err(DeviceError::Timeout { method, .. }) => assert_eq!(method, "feed_filament"),
        other => panic!("expected Timeout, got {:?}", other.map(|_| ())),
    }
    assert_eq!(driver.metrics().command_timeouts, 1);

    // the same key is free again and its reply must not be the stale one
    fake.with(|s| s.delays.clear());
    let outcome = driver.feed(0, 20, Some(30)).await.expect("second feed");
    assert_eq!(outcome.moved_mm, Some(20));

    let orphaned = wait_until(Duration::from_secs(1), || driver.metrics().orphan_responses >= 1).await;
    assert!(orphaned, "the late reply should be dropped as an orphan");
    assert!(driver.cached_status().in_flight.is_empty());
}

#[tokio::test]
async fn busy_key_waits_instead_of_writing_twice() {
    let fake = FakeAce::new();
    fake.with(|s| {
        s.delays.insert("feed_filament".into(), Duration::from_millis(150));
    });
    let mut config = test_config();
    config.response_timeout_ms = 1_000;
    let driver = Arc::new(AceDriver::with_connector(config, fake.connector()));
    driver.connect().await.expect("connect");

    let first = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.feed(1, 10, Some(20)).await })
    };
    let second = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.feed(1, 15, Some(20)).await })
    };

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(fake.count("feed_filament"), 1, "second request must wait for the key");

    let first = first.await.expect("join").expect("first feed");
    let second = second.await.expect("join").expect("second feed");
    let mut moved = vec![first.moved_mm, second.moved_mm];
    moved.sort();
    assert_eq!(moved, vec![Some(10), Some(15)]);
    assert_eq!(fake.count("feed_filament"), 2);
}

#[tokio::test]
async fn different_ports_are_not_serialized() {
    let fake = FakeAce::new();
    fake.with(|s| {
        s.delays.insert("feed_filament".into(), Duration::from_millis(150));
    });
    let mut config = test_config();
    config.response_timeout_ms = 1_000;
    let driver = Arc::new(AceDriver::with_connector(config, fake.connector()));
    driver.connect().await.expect("connect");

    let handles: Vec<_> = [0, 2]
        .into_iter()
        .map(|port| {
            let driver = driver.clone();
            tokio::spawn(async move { driver.feed(port, 10, Some(20)).await })
        })
        .collect();

    assert!(wait_until(Duration::from_millis(100), || fake.count("feed_filament") == 2).await);
    for handle in handles {
        handle.await.expect("join").expect("feed");
    }
}

#[tokio::test]
async fn corrupt_frame_is_skipped_and_link_stays_up() {
    let fake = FakeAce::new();
    let driver = AceDriver::with_connector(test_config(), fake.connector());
    driver.connect().await.expect("connect");

    fake.with(|s| s.corrupt_next = true);
    let status = driver.status().await.expect("status after resync");
    assert!(status.synced);

    assert!(wait_until(Duration::from_secs(1), || driver.metrics().corrupt_frames >= 1).await);
    assert!(driver.metrics().last_error.is_some());
    // the two junk bytes in front of the bad frame
    assert!(driver.metrics().noise_bytes >= 2);
    assert!(driver.link().is_connected());
    assert_eq!(fake.opens(), 1);
}

#[tokio::test]
async fn unsolicited_status_updates_snapshot() {
    let fake = FakeAce::new();
    let mut config = test_config();
    config.status_poll_interval_ms = 0;
    let driver = AceDriver::with_connector(config, fake.connector());
    driver.connect().await.expect("connect");
    assert!(wait_until(Duration::from_secs(1), || driver.cached_status().info.is_some()).await);

    let before = driver.metrics().status_pushes;
    assert!(!driver.cached_status().synced);

    fake.with(|s| s.feed_assist_count = 42);
    fake.push_status().await;

    assert!(wait_until(Duration::from_secs(1), || driver.metrics().status_pushes == before + 1).await);
    let status = driver.cached_status();
    assert!(status.synced);
    assert_eq!(status.feed_assist_count, 42);
    assert_eq!(driver.metrics().orphan_responses, 0);
}

#[tokio::test]
async fn completed_requests_feed_latency_metrics() {
    let fake = FakeAce::new();
    let driver = AceDriver::with_connector(test_config(), fake.connector());
    driver.connect().await.expect("connect");

    for _ in 0..3 {
        driver.status().await.expect("status");
    }
    let metrics = driver.metrics();
    assert!(metrics.command_completed >= 3);
    assert_eq!(metrics.command_completed, metrics.command_latency_samples);
    assert!(metrics.command_min_latency_ms <= metrics.command_max_latency_ms);
    assert!(metrics.frames_written >= metrics.command_completed);
}

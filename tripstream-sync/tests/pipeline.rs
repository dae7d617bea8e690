//! End-to-end pipeline scenarios over real storage backends.

use jiff::{SignedDuration, Timestamp};
use tripstream_core::*;
use tripstream_sync::extract::TripThresholds;
use tripstream_sync::orchestrator::{SyncConfig, SyncOrchestrator};
use tripstream_sync::ratelimit::RateLimitConfig;
use tripstream_sync::storage::sqlite::SqliteStorage;
use tripstream_sync::storage::{CheckpointStore, TripStore};
use tripstream_sync::upstream::TripReport;
use tripstream_sync::upstream::mock::MockProvider;

fn device() -> DeviceId {
    DeviceId::new("86433334444")
}

fn fast_ratelimit() -> RateLimitConfig {
    RateLimitConfig {
        min_interval_ms: 1,
        burst_limit: 100,
        burst_window_ms: 10,
        backoff_base_ms: 5,
        backoff_cap_ms: 20,
        max_retries: 1,
        network_backoff_base_ms: 5,
        network_backoff_cap_ms: 20,
        network_max_retries: 1,
    }
}

fn orchestrator(
    provider: MockProvider,
    storage: SqliteStorage,
) -> SyncOrchestrator<MockProvider, SqliteStorage> {
    SyncOrchestrator::new(
        provider,
        storage,
        SyncConfig {
            batch_pause_ms: 0,
            device_pause_ms: 0,
            ..SyncConfig::default()
        },
        TripThresholds::default(),
        fast_ratelimit(),
    )
}

/// One drive: ignition on, steady movement, ignition off.
fn drive(start: Timestamp, minutes: i64) -> Vec<PositionSample> {
    let steps = minutes * 2;
    (0..=steps)
        .map(|i| {
            let last = i == steps;
            PositionSample {
                device_id: device(),
                timestamp: start + SignedDuration::from_secs(i * 30),
                latitude: 41.0 + 0.001 * i as f64,
                longitude: 2.1,
                speed_raw: if last { 0.0 } else { 45.0 },
                heading: Some(0.0),
                ignition: if last {
                    IgnitionState::Off
                } else {
                    IgnitionState::On
                },
                ignition_source: IgnitionSource::HardwareBit,
                ignition_confidence: Some(0.95),
            }
        })
        .collect()
}

#[tokio::test]
async fn sqlite_rerun_is_idempotent() {
    let storage = SqliteStorage::new_in_memory().await.unwrap();
    let start = Timestamp::now() - SignedDuration::from_hours(3);
    storage.seed_positions(drive(start, 15)).await.unwrap();

    let orch = orchestrator(MockProvider::default(), storage.clone());

    let first = orch
        .sync_devices(vec![device()], SyncKind::Incremental)
        .await;
    assert!(first.success);
    assert_eq!(first.trips_created(), 1);

    let second = orch
        .sync_devices(vec![device()], SyncKind::Incremental)
        .await;
    assert!(second.success);
    assert_eq!(second.trips_created(), 0);
    // The re-extracted trip was recognized and skipped, not lost.
    assert_eq!(second.trips_skipped(), 1);
}

#[tokio::test]
async fn week_of_upstream_reports_supersedes_local() {
    let storage = SqliteStorage::new_in_memory().await.unwrap();
    let provider = MockProvider::default();

    // One drive per day for five days, each also reported upstream.
    let now = Timestamp::now();
    for day in 1..=5 {
        let start = now - SignedDuration::from_hours(24 * day);
        storage.seed_positions(drive(start, 20)).await.unwrap();
        provider.push_report(
            device(),
            TripReport {
                started_at: start,
                ended_at: start + SignedDuration::from_secs(20 * 60),
                start_latitude: Some(41.0),
                start_longitude: Some(2.1),
                end_latitude: Some(41.04),
                end_longitude: Some(2.1),
                distance_km: Some(4.4),
                max_speed: Some(52.0),
                avg_speed: Some(33.0),
            },
        );
    }

    let orch = orchestrator(provider, storage.clone());
    let report = orch.sync_devices(vec![device()], SyncKind::Full).await;

    assert!(report.success);
    assert_eq!(report.trips_created(), 5);

    let trips = storage
        .trips_in_window(&device(), now - SignedDuration::from_hours(24 * 7), now)
        .await
        .unwrap();
    assert_eq!(trips.len(), 5);
    // Every persisted trip came from the provider; the overlapping local
    // extractions were all dropped in reconciliation.
    assert!(trips.iter().all(|t| t.source == TripSource::UpstreamReport));
}

#[tokio::test]
async fn missing_report_coordinates_are_backfilled() {
    let storage = SqliteStorage::new_in_memory().await.unwrap();
    let provider = MockProvider::default();

    let start = Timestamp::now() - SignedDuration::from_hours(2);
    let samples = drive(start, 10);
    let first_fix = (samples[0].latitude, samples[0].longitude);
    let last = samples.len() - 1;
    let last_fix = (samples[last].latitude, samples[last].longitude);
    let ended = samples[last].timestamp;
    storage.seed_positions(samples).await.unwrap();

    provider.push_report(
        device(),
        TripReport {
            started_at: start,
            ended_at: ended,
            start_latitude: None,
            start_longitude: None,
            end_latitude: None,
            end_longitude: None,
            distance_km: None,
            max_speed: Some(48.0),
            avg_speed: Some(30.0),
        },
    );

    let orch = orchestrator(provider, storage.clone());
    let report = orch
        .sync_devices(vec![device()], SyncKind::Incremental)
        .await;
    assert!(report.success);
    assert_eq!(report.trips_created(), 1);

    let trips = storage
        .trips_in_window(&device(), start - SignedDuration::from_hours(1), Timestamp::now())
        .await
        .unwrap();
    let trip = &trips[0];
    assert_eq!(trip.source, TripSource::UpstreamReport);
    assert_eq!((trip.start_latitude, trip.start_longitude), first_fix);
    assert_eq!((trip.end_latitude, trip.end_longitude), last_fix);
    // Distance was recomputed from the filled-in endpoints.
    assert!(trip.distance_km > 1.0, "distance {}", trip.distance_km);
}

#[tokio::test]
async fn failed_device_keeps_previous_checkpoint() {
    let storage = SqliteStorage::new_in_memory().await.unwrap();
    let start = Timestamp::now() - SignedDuration::from_hours(3);
    storage.seed_positions(drive(start, 15)).await.unwrap();

    let orch = orchestrator(MockProvider::default(), storage.clone());
    let first = orch
        .sync_devices(vec![device()], SyncKind::Incremental)
        .await;
    assert!(first.success);
    let good = storage.get_checkpoint(&device()).await.unwrap().unwrap();
    assert_eq!(good.status, SyncStatus::Completed);

    let throttled = MockProvider::default();
    throttled.throttle_next(10);
    let orch = orchestrator(throttled, storage.clone());
    let second = orch
        .sync_devices(vec![device()], SyncKind::Incremental)
        .await;
    assert!(!second.success);
    assert_eq!(second.devices.len(), 1);
    assert!(second.devices[0].error.is_some());

    let after = storage.get_checkpoint(&device()).await.unwrap().unwrap();
    assert_eq!(after.status, SyncStatus::Error);
    assert!(after.error_message.is_some());
    // The high-water mark did not move, so the next run retries the window.
    assert_eq!(after.last_processed, good.last_processed);
}

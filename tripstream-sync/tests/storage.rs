use jiff::{SignedDuration, Timestamp};
use tempfile::NamedTempFile;
use ulid::Ulid;

use tripstream_core::*;
use tripstream_sync::storage::memory::{MemoryStorage, MemoryStorageError};
use tripstream_sync::storage::sqlite::{SqliteStorage, SqliteStorageError};
use tripstream_sync::storage::{CheckpointStore, PositionStore, RateLimitStore, TripStore};

fn device() -> DeviceId {
    DeviceId::new("86411112222")
}

fn dummy_sample(offset_secs: i64) -> PositionSample {
    PositionSample {
        device_id: device(),
        timestamp: base_time() + SignedDuration::from_secs(offset_secs),
        latitude: 40.4 + 0.0001 * offset_secs as f64,
        longitude: -3.7,
        speed_raw: 33.0,
        heading: Some(180.0),
        ignition: IgnitionState::On,
        ignition_source: IgnitionSource::HardwareBit,
        ignition_confidence: Some(0.9),
    }
}

fn dummy_trip(start_offset_secs: i64, end_offset_secs: i64) -> Trip {
    Trip {
        id: TripId(Ulid::new()),
        device_id: device(),
        started_at: base_time() + SignedDuration::from_secs(start_offset_secs),
        ended_at: base_time() + SignedDuration::from_secs(end_offset_secs),
        start_latitude: 40.4,
        start_longitude: -3.7,
        end_latitude: 40.45,
        end_longitude: -3.68,
        distance_km: 7.2,
        max_speed_kmh: 88.0,
        avg_speed_kmh: 41.5,
        duration_seconds: end_offset_secs - start_offset_secs,
        source: TripSource::LocallyExtracted,
    }
}

fn base_time() -> Timestamp {
    "2026-08-10T06:00:00Z".parse().unwrap()
}

/// memory storage tests
#[tokio::test]
async fn memory_trip_lifecycle() -> Result<(), MemoryStorageError> {
    let storage = MemoryStorage::default();

    let trip = dummy_trip(0, 600);
    let trip_id = trip.id;
    storage.insert_trip(trip).await?;

    let fetched = storage.get_trip(trip_id).await?.expect("trip must exist");
    assert_eq!(fetched.duration_seconds, 600);

    // Window queries use intersection, not containment.
    let partial = storage
        .trips_in_window(
            &device(),
            base_time() + SignedDuration::from_secs(300),
            base_time() + SignedDuration::from_secs(900),
        )
        .await?;
    assert_eq!(partial.len(), 1);

    let outside = storage
        .trips_in_window(
            &device(),
            base_time() + SignedDuration::from_secs(700),
            base_time() + SignedDuration::from_secs(900),
        )
        .await?;
    assert!(outside.is_empty());

    Ok(())
}

#[tokio::test]
async fn memory_checkpoint_upsert() -> Result<(), MemoryStorageError> {
    let storage = MemoryStorage::default();

    assert!(storage.get_checkpoint(&device()).await?.is_none());

    let mut checkpoint = SyncCheckpoint::new(device(), base_time());
    storage.upsert_checkpoint(checkpoint.clone()).await?;

    checkpoint.status = SyncStatus::Completed;
    checkpoint.last_processed = base_time() + SignedDuration::from_hours(1);
    storage.upsert_checkpoint(checkpoint).await?;

    let fetched = storage
        .get_checkpoint(&device())
        .await?
        .expect("checkpoint must exist");
    assert_eq!(fetched.status, SyncStatus::Completed);
    assert_eq!(
        fetched.last_processed,
        base_time() + SignedDuration::from_hours(1)
    );

    Ok(())
}

#[tokio::test]
async fn memory_rate_limit_roundtrip() -> Result<(), MemoryStorageError> {
    let storage = MemoryStorage::default();

    let initial = storage.load_rate_limit().await?;
    assert!(initial.last_call_at.is_none());
    assert!(initial.backoff_until.is_none());

    let state = RateLimitState {
        last_call_at: Some(base_time()),
        calls_in_window: 2,
        window_started_at: Some(base_time()),
        backoff_until: Some(base_time() + SignedDuration::from_secs(30)),
    };
    storage.store_rate_limit(state).await?;

    let loaded = storage.load_rate_limit().await?;
    assert_eq!(loaded.calls_in_window, 2);
    assert_eq!(loaded.backoff_until, state.backoff_until);

    Ok(())
}

/// sqlite storage tests
#[tokio::test]
async fn sqlite_position_window() -> Result<(), SqliteStorageError> {
    let storage = SqliteStorage::new_in_memory().await?;

    storage
        .seed_positions((0..10).map(|i| dummy_sample(i * 60)))
        .await?;

    let window = storage
        .positions_in_window(
            &device(),
            base_time() + SignedDuration::from_secs(120),
            base_time() + SignedDuration::from_secs(300),
        )
        .await?;
    assert_eq!(window.len(), 4);
    assert!(window.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let devices = storage.known_devices().await?;
    assert_eq!(devices, vec![device()]);

    Ok(())
}

#[tokio::test]
async fn sqlite_trip_roundtrip_preserves_fields() -> Result<(), SqliteStorageError> {
    let storage = SqliteStorage::new_in_memory().await?;

    let mut trip = dummy_trip(0, 1800);
    trip.source = TripSource::UpstreamReport;
    let trip_id = trip.id;
    storage.insert_trip(trip.clone()).await?;

    let fetched = storage.get_trip(trip_id).await?.expect("trip must exist");
    assert_eq!(fetched.device_id, trip.device_id);
    assert_eq!(fetched.started_at, trip.started_at);
    assert_eq!(fetched.ended_at, trip.ended_at);
    assert_eq!(fetched.source, TripSource::UpstreamReport);
    assert_eq!(fetched.distance_km, trip.distance_km);

    Ok(())
}

#[tokio::test]
async fn sqlite_checkpoint_upsert() -> Result<(), SqliteStorageError> {
    let storage = SqliteStorage::new_in_memory().await?;

    let mut checkpoint = SyncCheckpoint::new(device(), base_time());
    storage.upsert_checkpoint(checkpoint.clone()).await?;

    checkpoint.status = SyncStatus::Error;
    checkpoint.error_message = Some("upstream returned 502".into());
    checkpoint.trips_processed = 3;
    checkpoint.trips_total = 7;
    checkpoint.progress_percent = 42;
    storage.upsert_checkpoint(checkpoint).await?;

    let fetched = storage
        .get_checkpoint(&device())
        .await?
        .expect("checkpoint must exist");
    assert_eq!(fetched.status, SyncStatus::Error);
    assert_eq!(fetched.error_message.as_deref(), Some("upstream returned 502"));
    assert_eq!(fetched.trips_processed, 3);
    assert_eq!(fetched.trips_total, 7);
    assert_eq!(fetched.progress_percent, 42);

    Ok(())
}

#[tokio::test]
async fn sqlite_rate_limit_roundtrip() -> Result<(), SqliteStorageError> {
    let storage = SqliteStorage::new_in_memory().await?;

    let initial = storage.load_rate_limit().await?;
    assert!(initial.backoff_until.is_none());

    let state = RateLimitState {
        last_call_at: Some(base_time()),
        calls_in_window: 3,
        window_started_at: Some(base_time()),
        backoff_until: None,
    };
    storage.store_rate_limit(state).await?;

    let loaded = storage.load_rate_limit().await?;
    assert_eq!(loaded.last_call_at, Some(base_time()));
    assert_eq!(loaded.calls_in_window, 3);

    Ok(())
}

#[tokio::test]
async fn sqlite_survives_reopen() -> Result<(), SqliteStorageError> {
    let file = NamedTempFile::new().expect("temp file");
    let path = file.path().to_path_buf();

    let trip = dummy_trip(0, 900);
    let trip_id = trip.id;
    {
        let storage = SqliteStorage::new(&path).await?;
        storage.insert_trip(trip).await?;
    }

    let storage = SqliteStorage::new(&path).await?;
    let fetched = storage.get_trip(trip_id).await?;
    assert!(fetched.is_some(), "trip must survive a reopen");

    Ok(())
}

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions};
use ulid::Ulid;

use tripstream_core::{
    DeviceId, IgnitionSource, IgnitionState, PositionSample, RateLimitState, SyncCheckpoint,
    SyncStatus, Trip, TripId, TripSource,
};

use crate::storage::{CheckpointStore, PositionStore, RateLimitStore, TripStore};

#[derive(Debug, thiserror::Error)]
pub enum SqliteStorageError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("invalid enum value: {0}")]
    InvalidEnum(String),
}

/// SQLite-backed storage for samples, trips, checkpoints and the shared
/// rate-limit row.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Opens or creates a SQLite database at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, SqliteStorageError> {
        let connection_string = format!("sqlite:{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePoolOptions::new().connect(&connection_string).await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, SqliteStorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), SqliteStorageError> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS position_samples (
                device_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                speed_raw REAL NOT NULL,
                heading REAL,
                ignition TEXT NOT NULL,
                ignition_source TEXT NOT NULL,
                ignition_confidence REAL
            );

            CREATE INDEX IF NOT EXISTS idx_positions_device_time
            ON position_samples(device_id, timestamp);

            CREATE TABLE IF NOT EXISTS trips (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER NOT NULL,
                start_latitude REAL NOT NULL,
                start_longitude REAL NOT NULL,
                end_latitude REAL NOT NULL,
                end_longitude REAL NOT NULL,
                distance_km REAL NOT NULL,
                max_speed_kmh REAL NOT NULL,
                avg_speed_kmh REAL NOT NULL,
                duration_seconds INTEGER NOT NULL,
                source TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_trips_device_start
            ON trips(device_id, started_at);

            CREATE TABLE IF NOT EXISTS sync_checkpoints (
                device_id TEXT PRIMARY KEY,
                last_processed INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                trips_processed INTEGER NOT NULL DEFAULT 0,
                trips_total INTEGER NOT NULL DEFAULT 0,
                progress_percent INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rate_limit_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_call_at INTEGER,
                calls_in_window INTEGER NOT NULL DEFAULT 0,
                window_started_at INTEGER,
                backoff_until INTEGER
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Seed raw samples, standing in for the external ingestion process.
    pub async fn seed_positions(
        &self,
        samples: impl IntoIterator<Item = PositionSample>,
    ) -> Result<(), SqliteStorageError> {
        let mut tx = self.pool.begin().await?;

        for sample in samples {
            sqlx::query(
                r#"
                INSERT INTO position_samples
                (device_id, timestamp, latitude, longitude, speed_raw, heading,
                 ignition, ignition_source, ignition_confidence)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(sample.device_id.as_str())
            .bind(sample.timestamp.as_millisecond())
            .bind(sample.latitude)
            .bind(sample.longitude)
            .bind(sample.speed_raw)
            .bind(sample.heading)
            .bind(ignition_to_str(sample.ignition))
            .bind(ignition_source_to_str(sample.ignition_source))
            .bind(sample.ignition_confidence)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PositionStore for SqliteStorage {
    type Error = SqliteStorageError;

    async fn positions_in_window(
        &self,
        device_id: &DeviceId,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<Vec<PositionSample>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, timestamp, latitude, longitude, speed_raw, heading,
                   ignition, ignition_source, ignition_confidence
            FROM position_samples
            WHERE device_id = ? AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(device_id.as_str())
        .bind(start.as_millisecond())
        .bind(end.as_millisecond())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row_to_sample).collect()
    }

    async fn known_devices(&self) -> Result<Vec<DeviceId>, Self::Error> {
        let rows = sqlx::query("SELECT DISTINCT device_id FROM position_samples")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| {
                let id: String = r.try_get("device_id")?;
                Ok(DeviceId::new(id))
            })
            .collect()
    }
}

#[async_trait]
impl TripStore for SqliteStorage {
    type Error = SqliteStorageError;

    async fn insert_trip(&self, trip: Trip) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO trips
            (id, device_id, started_at, ended_at, start_latitude, start_longitude,
             end_latitude, end_longitude, distance_km, max_speed_kmh, avg_speed_kmh,
             duration_seconds, source)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(trip.id.0.to_string())
        .bind(trip.device_id.as_str())
        .bind(trip.started_at.as_millisecond())
        .bind(trip.ended_at.as_millisecond())
        .bind(trip.start_latitude)
        .bind(trip.start_longitude)
        .bind(trip.end_latitude)
        .bind(trip.end_longitude)
        .bind(trip.distance_km)
        .bind(trip.max_speed_kmh)
        .bind(trip.avg_speed_kmh)
        .bind(trip.duration_seconds)
        .bind(trip_source_to_str(trip.source))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn trips_in_window(
        &self,
        device_id: &DeviceId,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<Vec<Trip>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, started_at, ended_at, start_latitude, start_longitude,
                   end_latitude, end_longitude, distance_km, max_speed_kmh, avg_speed_kmh,
                   duration_seconds, source
            FROM trips
            WHERE device_id = ? AND started_at <= ? AND ended_at >= ?
            ORDER BY started_at ASC
            "#,
        )
        .bind(device_id.as_str())
        .bind(end.as_millisecond())
        .bind(start.as_millisecond())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row_to_trip).collect()
    }

    async fn get_trip(&self, id: TripId) -> Result<Option<Trip>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, device_id, started_at, ended_at, start_latitude, start_longitude,
                   end_latitude, end_longitude, distance_km, max_speed_kmh, avg_speed_kmh,
                   duration_seconds, source
            FROM trips WHERE id = ?
            "#,
        )
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| map_row_to_trip(&r)).transpose()
    }
}

#[async_trait]
impl CheckpointStore for SqliteStorage {
    type Error = SqliteStorageError;

    async fn get_checkpoint(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<SyncCheckpoint>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT device_id, last_processed, status, error_message,
                   trips_processed, trips_total, progress_percent, updated_at
            FROM sync_checkpoints WHERE device_id = ?
            "#,
        )
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| map_row_to_checkpoint(&r)).transpose()
    }

    async fn upsert_checkpoint(&self, checkpoint: SyncCheckpoint) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints
            (device_id, last_processed, status, error_message,
             trips_processed, trips_total, progress_percent, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
                last_processed = excluded.last_processed,
                status = excluded.status,
                error_message = excluded.error_message,
                trips_processed = excluded.trips_processed,
                trips_total = excluded.trips_total,
                progress_percent = excluded.progress_percent,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(checkpoint.device_id.as_str())
        .bind(checkpoint.last_processed.as_millisecond())
        .bind(sync_status_to_str(checkpoint.status))
        .bind(checkpoint.error_message.as_deref())
        .bind(checkpoint.trips_processed as i64)
        .bind(checkpoint.trips_total as i64)
        .bind(checkpoint.progress_percent as i64)
        .bind(checkpoint.updated_at.as_millisecond())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for SqliteStorage {
    type Error = SqliteStorageError;

    async fn load_rate_limit(&self) -> Result<RateLimitState, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT last_call_at, calls_in_window, window_started_at, backoff_until
            FROM rate_limit_state WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(RateLimitState::default());
        };

        Ok(RateLimitState {
            last_call_at: opt_timestamp(row.try_get("last_call_at")?)?,
            calls_in_window: row.try_get::<i64, _>("calls_in_window")? as u32,
            window_started_at: opt_timestamp(row.try_get("window_started_at")?)?,
            backoff_until: opt_timestamp(row.try_get("backoff_until")?)?,
        })
    }

    async fn store_rate_limit(&self, state: RateLimitState) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_state (id, last_call_at, calls_in_window, window_started_at, backoff_until)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                last_call_at = excluded.last_call_at,
                calls_in_window = excluded.calls_in_window,
                window_started_at = excluded.window_started_at,
                backoff_until = excluded.backoff_until
            "#,
        )
        .bind(state.last_call_at.map(|t| t.as_millisecond()))
        .bind(state.calls_in_window as i64)
        .bind(state.window_started_at.map(|t| t.as_millisecond()))
        .bind(state.backoff_until.map(|t| t.as_millisecond()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn timestamp_from_millis(millis: i64) -> Result<jiff::Timestamp, SqliteStorageError> {
    jiff::Timestamp::from_millisecond(millis)
        .map_err(|_| SqliteStorageError::InvalidTimestamp(millis))
}

fn opt_timestamp(millis: Option<i64>) -> Result<Option<jiff::Timestamp>, SqliteStorageError> {
    millis.map(timestamp_from_millis).transpose()
}

fn ignition_to_str(state: IgnitionState) -> &'static str {
    match state {
        IgnitionState::On => "on",
        IgnitionState::Off => "off",
        IgnitionState::Unknown => "unknown",
    }
}

fn ignition_from_str(s: &str) -> Result<IgnitionState, SqliteStorageError> {
    match s {
        "on" => Ok(IgnitionState::On),
        "off" => Ok(IgnitionState::Off),
        "unknown" => Ok(IgnitionState::Unknown),
        other => Err(SqliteStorageError::InvalidEnum(other.to_string())),
    }
}

fn ignition_source_to_str(source: IgnitionSource) -> &'static str {
    match source {
        IgnitionSource::HardwareBit => "hardware_bit",
        IgnitionSource::ParsedString => "parsed_string",
        IgnitionSource::None => "none",
    }
}

fn ignition_source_from_str(s: &str) -> Result<IgnitionSource, SqliteStorageError> {
    match s {
        "hardware_bit" => Ok(IgnitionSource::HardwareBit),
        "parsed_string" => Ok(IgnitionSource::ParsedString),
        "none" => Ok(IgnitionSource::None),
        other => Err(SqliteStorageError::InvalidEnum(other.to_string())),
    }
}

fn trip_source_to_str(source: TripSource) -> &'static str {
    match source {
        TripSource::UpstreamReport => "upstream_report",
        TripSource::LocallyExtracted => "locally_extracted",
    }
}

fn trip_source_from_str(s: &str) -> Result<TripSource, SqliteStorageError> {
    match s {
        "upstream_report" => Ok(TripSource::UpstreamReport),
        "locally_extracted" => Ok(TripSource::LocallyExtracted),
        other => Err(SqliteStorageError::InvalidEnum(other.to_string())),
    }
}

fn sync_status_to_str(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::Idle => "idle",
        SyncStatus::Processing => "processing",
        SyncStatus::Completed => "completed",
        SyncStatus::Error => "error",
    }
}

fn sync_status_from_str(s: &str) -> Result<SyncStatus, SqliteStorageError> {
    match s {
        "idle" => Ok(SyncStatus::Idle),
        "processing" => Ok(SyncStatus::Processing),
        "completed" => Ok(SyncStatus::Completed),
        "error" => Ok(SyncStatus::Error),
        other => Err(SqliteStorageError::InvalidEnum(other.to_string())),
    }
}

fn map_row_to_sample(r: &sqlx::sqlite::SqliteRow) -> Result<PositionSample, SqliteStorageError> {
    let ignition_str: String = r.try_get("ignition")?;
    let source_str: String = r.try_get("ignition_source")?;

    Ok(PositionSample {
        device_id: DeviceId::new(r.try_get::<String, _>("device_id")?),
        timestamp: timestamp_from_millis(r.try_get("timestamp")?)?,
        latitude: r.try_get("latitude")?,
        longitude: r.try_get("longitude")?,
        speed_raw: r.try_get("speed_raw")?,
        heading: r.try_get("heading")?,
        ignition: ignition_from_str(&ignition_str)?,
        ignition_source: ignition_source_from_str(&source_str)?,
        ignition_confidence: r.try_get("ignition_confidence")?,
    })
}

fn map_row_to_trip(r: &sqlx::sqlite::SqliteRow) -> Result<Trip, SqliteStorageError> {
    let id_str: String = r.try_get("id")?;
    let id = Ulid::from_str(&id_str).map_err(|_| SqliteStorageError::InvalidUlid(id_str))?;

    let source_str: String = r.try_get("source")?;

    Ok(Trip {
        id: TripId(id),
        device_id: DeviceId::new(r.try_get::<String, _>("device_id")?),
        started_at: timestamp_from_millis(r.try_get("started_at")?)?,
        ended_at: timestamp_from_millis(r.try_get("ended_at")?)?,
        start_latitude: r.try_get("start_latitude")?,
        start_longitude: r.try_get("start_longitude")?,
        end_latitude: r.try_get("end_latitude")?,
        end_longitude: r.try_get("end_longitude")?,
        distance_km: r.try_get("distance_km")?,
        max_speed_kmh: r.try_get("max_speed_kmh")?,
        avg_speed_kmh: r.try_get("avg_speed_kmh")?,
        duration_seconds: r.try_get("duration_seconds")?,
        source: trip_source_from_str(&source_str)?,
    })
}

fn map_row_to_checkpoint(
    r: &sqlx::sqlite::SqliteRow,
) -> Result<SyncCheckpoint, SqliteStorageError> {
    let status_str: String = r.try_get("status")?;

    Ok(SyncCheckpoint {
        device_id: DeviceId::new(r.try_get::<String, _>("device_id")?),
        last_processed: timestamp_from_millis(r.try_get("last_processed")?)?,
        status: sync_status_from_str(&status_str)?,
        error_message: r
            .try_get::<Option<String>, _>("error_message")?
            .map(Into::into),
        trips_processed: r.try_get::<i64, _>("trips_processed")? as u32,
        trips_total: r.try_get::<i64, _>("trips_total")? as u32,
        progress_percent: r.try_get::<i64, _>("progress_percent")? as u8,
        updated_at: timestamp_from_millis(r.try_get("updated_at")?)?,
    })
}

pub mod geo;
pub mod speed;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

// We use `Box<str>` for structures that don't need to be dynamically
// sized. This helps us keep allocations compact and avoid accidental
// cloning of large values.
type BoxStr = Box<str>;

/// Provider-assigned identifier for a tracked vehicle device.
///
/// Device ids come from the upstream telematics provider (typically an
/// IMEI-like string), so unlike our own generated ids they are opaque text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub BoxStr);

impl DeviceId {
    pub fn new(id: impl Into<Box<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a derived trip record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TripId(pub Ulid);

/// Unique identifier for one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncRunId(pub Ulid);

/// Ignition reading attached to a position sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnitionState {
    On,
    Off,
    Unknown,
}

/// How the ignition state was obtained.
///
/// Only `HardwareBit` and `ParsedString` qualify as trip-start triggers;
/// speed-inferred ignition causes false positives from GPS jitter and is
/// never trusted for starting a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnitionSource {
    /// Dedicated ignition wire read by the device firmware.
    HardwareBit,
    /// Parsed from a status string in the device payload.
    ParsedString,
    /// No ignition data for this sample.
    None,
}

/// One raw telemetry reading for a device.
///
/// Samples are inserted by an external ingestion process and are read-only
/// to this service. Storage order is not assumed sorted; extraction sorts
/// by timestamp first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSample {
    pub device_id: DeviceId,
    /// UTC time the fix was taken.
    pub timestamp: jiff::Timestamp,
    pub latitude: f64,
    pub longitude: f64,
    /// Speed as reported by the device, in whatever unit its firmware uses.
    /// Always pass through [`speed::normalize_kmh`] before comparing.
    pub speed_raw: f64,
    /// Course over ground in degrees, when reported.
    pub heading: Option<f64>,
    pub ignition: IgnitionState,
    pub ignition_source: IgnitionSource,
    /// Detection confidence in `0.0..=1.0`, when the firmware reports one.
    pub ignition_confidence: Option<f64>,
}

/// Where a trip record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripSource {
    /// Reported by the upstream provider's trip API.
    UpstreamReport,
    /// Reconstructed locally from raw position samples.
    LocallyExtracted,
}

/// A derived record of one completed vehicle journey.
///
/// Trips are written once by the orchestrator and never updated or deleted;
/// a superseding sync run simply skips duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub device_id: DeviceId,
    pub started_at: jiff::Timestamp,
    pub ended_at: jiff::Timestamp,
    pub start_latitude: f64,
    pub start_longitude: f64,
    pub end_latitude: f64,
    pub end_longitude: f64,
    /// Path distance accumulated along the sample track, in kilometers.
    pub distance_km: f64,
    pub max_speed_kmh: f64,
    pub avg_speed_kmh: f64,
    pub duration_seconds: i64,
    pub source: TripSource,
}

impl Trip {
    /// Straight-line distance between the trip endpoints, in meters.
    pub fn displacement_m(&self) -> f64 {
        geo::haversine_km(
            self.start_latitude,
            self.start_longitude,
            self.end_latitude,
            self.end_longitude,
        ) * 1000.0
    }

    /// True when either endpoint is missing a fix (0,0).
    pub fn has_missing_endpoint(&self) -> bool {
        (self.start_latitude == 0.0 && self.start_longitude == 0.0)
            || (self.end_latitude == 0.0 && self.end_longitude == 0.0)
    }
}

/// Sync progress state for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Processing,
    Completed,
    Error,
}

/// Per-device incremental sync progress marker.
///
/// Exactly one checkpoint exists per device. Updates are last-writer-wins;
/// `last_processed` only ever moves forward, and a failed run leaves it
/// unchanged so the next attempt retries the same window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub device_id: DeviceId,
    /// Upper bound of the last successfully synced window.
    pub last_processed: jiff::Timestamp,
    pub status: SyncStatus,
    /// Durable record of the last failure, cleared on success.
    pub error_message: Option<BoxStr>,
    pub trips_processed: u32,
    pub trips_total: u32,
    pub progress_percent: u8,
    pub updated_at: jiff::Timestamp,
}

impl SyncCheckpoint {
    /// Fresh checkpoint for a device that has never been synced.
    pub fn new(device_id: DeviceId, last_processed: jiff::Timestamp) -> Self {
        Self {
            device_id,
            last_processed,
            status: SyncStatus::Idle,
            error_message: None,
            trips_processed: 0,
            trips_total: 0,
            progress_percent: 0,
            updated_at: jiff::Timestamp::now(),
        }
    }
}

/// Shared pacing state for the rate-limited upstream client.
///
/// Persisted in shared storage so every concurrent invocation sees the
/// same call history and, crucially, the same `backoff_until` after any
/// one of them gets throttled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateLimitState {
    pub last_call_at: Option<jiff::Timestamp>,
    /// Calls issued inside the current burst window.
    pub calls_in_window: u32,
    pub window_started_at: Option<jiff::Timestamp>,
    /// No caller may issue a request before this instant.
    pub backoff_until: Option<jiff::Timestamp>,
}

/// Which lookback rule a sync run used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    /// Window resumes from the device checkpoint, minus a fixed overlap.
    Incremental,
    /// Wide lookback ignoring the checkpoint.
    Full,
    /// Short fixed lookback for event-triggered re-syncs.
    Recent,
}

/// Outcome of syncing a single device within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSyncOutcome {
    pub device_id: DeviceId,
    pub trips_created: u32,
    pub trips_skipped: u32,
    /// Set when this device's run failed; other devices still proceed.
    pub error: Option<BoxStr>,
}

/// Structured result of one orchestrator invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: SyncRunId,
    pub kind: SyncKind,
    /// False when any device in the batch failed.
    pub success: bool,
    pub started_at: jiff::Timestamp,
    pub duration_ms: u64,
    pub devices: Vec<DeviceSyncOutcome>,
    pub errors: Vec<BoxStr>,
}

impl SyncReport {
    pub fn trips_created(&self) -> u32 {
        self.devices.iter().map(|d| d.trips_created).sum()
    }

    pub fn trips_skipped(&self) -> u32 {
        self.devices.iter().map(|d| d.trips_skipped).sum()
    }
}

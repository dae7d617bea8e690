pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use tripstream_core::{DeviceId, PositionSample, RateLimitState, SyncCheckpoint, Trip, TripId};

/// Read access to raw position samples.
///
/// Samples are written by an external ingestion process; this service only
/// ever reads them. Implementations return samples sorted ascending by
/// timestamp.
#[async_trait]
pub trait PositionStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch samples for one device inside `[start, end]`.
    async fn positions_in_window(
        &self,
        device_id: &DeviceId,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<Vec<PositionSample>, Self::Error>;

    /// Distinct device ids present in the sample store. Used to resolve an
    /// empty device list on a sync invocation.
    async fn known_devices(&self) -> Result<Vec<DeviceId>, Self::Error>;
}

/// Persistence for derived trips.
#[async_trait]
pub trait TripStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Insert one trip. The caller is responsible for having run dedup
    /// first; constraint violations are not a normal path here.
    async fn insert_trip(&self, trip: Trip) -> Result<(), Self::Error>;

    /// Trips for a device whose time range intersects `[start, end]`,
    /// sorted ascending by start time.
    async fn trips_in_window(
        &self,
        device_id: &DeviceId,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<Vec<Trip>, Self::Error>;

    async fn get_trip(&self, id: TripId) -> Result<Option<Trip>, Self::Error>;
}

/// Persistence for per-device sync checkpoints. Upserts are last-writer-wins.
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get_checkpoint(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<SyncCheckpoint>, Self::Error>;

    async fn upsert_checkpoint(&self, checkpoint: SyncCheckpoint) -> Result<(), Self::Error>;
}

/// Persistence for the single shared rate-limit state row.
///
/// Every upstream call reads this before and writes it after, so a backoff
/// observed by one invocation is honored by all of them.
#[async_trait]
pub trait RateLimitStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn load_rate_limit(&self) -> Result<RateLimitState, Self::Error>;

    async fn store_rate_limit(&self, state: RateLimitState) -> Result<(), Self::Error>;
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tripstream_core::{DeviceId, PositionSample, RateLimitState, SyncCheckpoint, Trip, TripId};

use crate::storage::{CheckpointStore, PositionStore, RateLimitStore, TripStore};

/// In-memory storage implementation.
/// This is primarily intended for testing and as a reference
/// implementation of the storage traits.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    positions: Arc<Mutex<Vec<PositionSample>>>,
    trips: Arc<Mutex<HashMap<TripId, Trip>>>,
    checkpoints: Arc<Mutex<HashMap<DeviceId, SyncCheckpoint>>>,
    rate_limit: Arc<Mutex<RateLimitState>>,
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryStorageError {
    #[error("mutex poisoned: {0}")]
    MutexPoisoned(String),
}

impl<T> From<PoisonError<T>> for MemoryStorageError {
    fn from(err: PoisonError<T>) -> Self {
        MemoryStorageError::MutexPoisoned(err.to_string())
    }
}

impl MemoryStorage {
    /// Seed raw samples, standing in for the external ingestion process.
    pub fn seed_positions(
        &self,
        samples: impl IntoIterator<Item = PositionSample>,
    ) -> Result<(), MemoryStorageError> {
        let mut positions = self.positions.lock()?;
        positions.extend(samples);
        Ok(())
    }

    pub fn trip_count(&self) -> Result<usize, MemoryStorageError> {
        Ok(self.trips.lock()?.len())
    }
}

#[async_trait]
impl PositionStore for MemoryStorage {
    type Error = MemoryStorageError;

    async fn positions_in_window(
        &self,
        device_id: &DeviceId,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<Vec<PositionSample>, Self::Error> {
        let positions = self.positions.lock()?;

        let mut matching: Vec<PositionSample> = positions
            .iter()
            .filter(|s| &s.device_id == device_id && s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.timestamp);

        Ok(matching)
    }

    async fn known_devices(&self) -> Result<Vec<DeviceId>, Self::Error> {
        let positions = self.positions.lock()?;

        let mut devices: Vec<DeviceId> = Vec::new();
        for sample in positions.iter() {
            if !devices.contains(&sample.device_id) {
                devices.push(sample.device_id.clone());
            }
        }

        Ok(devices)
    }
}

#[async_trait]
impl TripStore for MemoryStorage {
    type Error = MemoryStorageError;

    async fn insert_trip(&self, trip: Trip) -> Result<(), Self::Error> {
        let mut trips = self.trips.lock()?;
        trips.insert(trip.id, trip);
        Ok(())
    }

    async fn trips_in_window(
        &self,
        device_id: &DeviceId,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<Vec<Trip>, Self::Error> {
        let trips = self.trips.lock()?;

        let mut matching: Vec<Trip> = trips
            .values()
            .filter(|t| &t.device_id == device_id && t.started_at <= end && t.ended_at >= start)
            .cloned()
            .collect();
        matching.sort_by_key(|t| t.started_at);

        Ok(matching)
    }

    async fn get_trip(&self, id: TripId) -> Result<Option<Trip>, Self::Error> {
        let trips = self.trips.lock()?;
        Ok(trips.get(&id).cloned())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStorage {
    type Error = MemoryStorageError;

    async fn get_checkpoint(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<SyncCheckpoint>, Self::Error> {
        let checkpoints = self.checkpoints.lock()?;
        Ok(checkpoints.get(device_id).cloned())
    }

    async fn upsert_checkpoint(&self, checkpoint: SyncCheckpoint) -> Result<(), Self::Error> {
        let mut checkpoints = self.checkpoints.lock()?;
        checkpoints.insert(checkpoint.device_id.clone(), checkpoint);
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for MemoryStorage {
    type Error = MemoryStorageError;

    async fn load_rate_limit(&self) -> Result<RateLimitState, Self::Error> {
        let state = self.rate_limit.lock()?;
        Ok(*state)
    }

    async fn store_rate_limit(&self, state: RateLimitState) -> Result<(), Self::Error> {
        let mut current = self.rate_limit.lock()?;
        *current = state;
        Ok(())
    }
}

//! Incremental sync orchestration.
//!
//! One run covers a batch of devices. Each device gets its own window,
//! pipeline pass and checkpoint update; a failure on one device is recorded
//! and the batch moves on.

use jiff::{SignedDuration, Timestamp};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use tripstream_core::{
    DeviceId, DeviceSyncOutcome, SyncCheckpoint, SyncKind, SyncReport, SyncRunId, SyncStatus,
};

use crate::extract::{TripThresholds, extract_trips};
use crate::ratelimit::{RateLimitConfig, RateLimitedClient};
use crate::reconcile::reconcile;
use crate::storage::{CheckpointStore, PositionStore, RateLimitStore, TripStore};
use crate::upstream::{UpstreamError, UpstreamProvider};

/// Window sizing and pacing for sync runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Lookback for a device with no checkpoint, in days
    pub lookback_days: i64,
    /// Lookback for a full sync, in days
    pub full_lookback_days: i64,
    /// Lookback for a recent sync, in hours
    pub recent_lookback_hours: i64,
    /// How far behind the checkpoint an incremental window starts, in hours.
    /// The overlap re-covers trips that were still in progress last run.
    pub checkpoint_overlap_hours: i64,
    /// Trips inserted per batch before pausing
    pub insert_batch_size: usize,
    /// Pause between insert batches, in milliseconds
    pub batch_pause_ms: u64,
    /// Pause between devices in one run, in milliseconds
    pub device_pause_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lookback_days: 7,
            full_lookback_days: 30,
            recent_lookback_hours: 24,
            checkpoint_overlap_hours: 6,
            insert_batch_size: 25,
            batch_pause_ms: 150,
            device_pause_ms: 1000,
        }
    }
}

/// Failure while syncing one device. Never aborts the batch.
#[derive(Debug, Error)]
pub enum SyncDeviceError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("storage: {0}")]
    Storage(String),
}

/// Runs the fetch/extract/reconcile/persist pipeline over devices.
///
/// The storage handle doubles as the rate-limit store so all upstream
/// pacing state lives next to the data it protects.
pub struct SyncOrchestrator<P, S> {
    client: RateLimitedClient<P, S>,
    storage: S,
    config: SyncConfig,
    thresholds: TripThresholds,
}

impl<P, S> SyncOrchestrator<P, S>
where
    P: UpstreamProvider,
    S: PositionStore + TripStore + CheckpointStore + RateLimitStore + Clone,
{
    pub fn new(
        provider: P,
        storage: S,
        config: SyncConfig,
        thresholds: TripThresholds,
        ratelimit: RateLimitConfig,
    ) -> Self {
        Self {
            client: RateLimitedClient::new(provider, storage.clone(), ratelimit),
            storage,
            config,
            thresholds,
        }
    }

    /// Sync a batch of devices. An empty list means every device present in
    /// the position store.
    pub async fn sync_devices(&self, device_ids: Vec<DeviceId>, kind: SyncKind) -> SyncReport {
        let run_id = SyncRunId(Ulid::new());
        let started_at = Timestamp::now();
        let clock = std::time::Instant::now();

        let mut report = SyncReport {
            run_id,
            kind,
            success: true,
            started_at,
            duration_ms: 0,
            devices: Vec::new(),
            errors: Vec::new(),
        };

        let device_ids = if device_ids.is_empty() {
            match self.storage.known_devices().await {
                Ok(ids) => ids,
                Err(e) => {
                    report.success = false;
                    report.errors.push(format!("listing devices: {e}").into());
                    report.duration_ms = clock.elapsed().as_millis() as u64;
                    return report;
                }
            }
        } else {
            device_ids
        };

        info!(run_id = %run_id.0, ?kind, devices = device_ids.len(), "sync run starting");

        let mut first = true;
        for device_id in device_ids {
            if !first {
                tokio::time::sleep(Duration::from_millis(self.config.device_pause_ms)).await;
            }
            first = false;

            let outcome = self.sync_device(&device_id, kind).await;
            if let Some(error) = &outcome.error {
                report.success = false;
                report.errors.push(format!("{device_id}: {error}").into());
            }
            report.devices.push(outcome);
        }

        report.duration_ms = clock.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id.0,
            success = report.success,
            trips_created = report.trips_created(),
            trips_skipped = report.trips_skipped(),
            duration_ms = report.duration_ms,
            "sync run finished"
        );
        report
    }

    /// Sync one device, absorbing its error into the outcome.
    pub async fn sync_device(&self, device_id: &DeviceId, kind: SyncKind) -> DeviceSyncOutcome {
        match self.run_device_pipeline(device_id, kind).await {
            Ok((created, skipped)) => DeviceSyncOutcome {
                device_id: device_id.clone(),
                trips_created: created,
                trips_skipped: skipped,
                error: None,
            },
            Err(e) => {
                error!(device_id = %device_id, error = %e, "device sync failed");
                DeviceSyncOutcome {
                    device_id: device_id.clone(),
                    trips_created: 0,
                    trips_skipped: 0,
                    error: Some(e.to_string().into()),
                }
            }
        }
    }

    async fn run_device_pipeline(
        &self,
        device_id: &DeviceId,
        kind: SyncKind,
    ) -> Result<(u32, u32), SyncDeviceError> {
        let now = Timestamp::now();
        let previous = self
            .storage
            .get_checkpoint(device_id)
            .await
            .map_err(storage_err)?;

        let window_start = self.window_start(kind, previous.as_ref(), now);
        debug!(
            device_id = %device_id,
            ?kind,
            window_start = %window_start,
            window_end = %now,
            "device window computed"
        );

        let mut checkpoint = previous
            .clone()
            .unwrap_or_else(|| SyncCheckpoint::new(device_id.clone(), window_start));
        checkpoint.status = SyncStatus::Processing;
        checkpoint.error_message = None;
        checkpoint.trips_processed = 0;
        checkpoint.trips_total = 0;
        checkpoint.progress_percent = 0;
        checkpoint.updated_at = now;
        self.storage
            .upsert_checkpoint(checkpoint.clone())
            .await
            .map_err(storage_err)?;

        match self.fetch_and_persist(device_id, window_start, now, &mut checkpoint).await {
            Ok((created, skipped, latest_end)) => {
                // The high-water mark only moves forward: to the latest
                // persisted trip end, or the window end when nothing landed.
                let mark = latest_end.unwrap_or(now);
                checkpoint.last_processed = checkpoint.last_processed.max(mark);
                checkpoint.status = SyncStatus::Completed;
                checkpoint.error_message = None;
                checkpoint.progress_percent = 100;
                checkpoint.updated_at = Timestamp::now();
                self.write_checkpoint_best_effort(&checkpoint).await;
                Ok((created, skipped))
            }
            Err(e) => {
                // Keep the old high-water mark so the next run retries this
                // same window.
                checkpoint.status = SyncStatus::Error;
                checkpoint.error_message = Some(e.to_string().into());
                checkpoint.updated_at = Timestamp::now();
                self.write_checkpoint_best_effort(&checkpoint).await;
                Err(e)
            }
        }
    }

    async fn fetch_and_persist(
        &self,
        device_id: &DeviceId,
        start: Timestamp,
        end: Timestamp,
        checkpoint: &mut SyncCheckpoint,
    ) -> Result<(u32, u32, Option<Timestamp>), SyncDeviceError> {
        let samples = self
            .storage
            .positions_in_window(device_id, start, end)
            .await
            .map_err(storage_err)?;
        let local = extract_trips(device_id, samples.clone(), &self.thresholds);

        let upstream = self.client.fetch_trip_reports(device_id, start, end).await?;

        let existing = self
            .storage
            .trips_in_window(device_id, start, end)
            .await
            .map_err(storage_err)?;

        let outcome = reconcile(
            device_id,
            upstream,
            local,
            &existing,
            &samples,
            &self.thresholds,
        );
        let skipped = outcome.skipped_total();

        checkpoint.trips_total = outcome.accepted.len() as u32;
        let mut created = 0u32;
        let mut insert_failures = 0u32;
        let mut latest_end: Option<Timestamp> = None;
        for batch in outcome.accepted.chunks(self.config.insert_batch_size.max(1)) {
            if created > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.batch_pause_ms)).await;
            }
            for trip in batch {
                // One bad row must not lose the rest of the sync.
                match self.storage.insert_trip(trip.clone()).await {
                    Ok(()) => {
                        created += 1;
                        latest_end = Some(latest_end.map_or(trip.ended_at, |m| m.max(trip.ended_at)));
                    }
                    Err(e) => {
                        insert_failures += 1;
                        warn!(
                            device_id = %device_id,
                            trip_id = %trip.id.0,
                            error = %e,
                            "trip insert failed, continuing"
                        );
                    }
                }
            }

            checkpoint.trips_processed = created;
            checkpoint.progress_percent = if checkpoint.trips_total == 0 {
                100
            } else {
                ((created * 100) / checkpoint.trips_total) as u8
            };
            checkpoint.updated_at = Timestamp::now();
            self.write_checkpoint_best_effort(checkpoint).await;
        }

        info!(
            device_id = %device_id,
            samples = samples.len(),
            trips_created = created,
            trips_skipped = skipped,
            insert_failures,
            "device sync complete"
        );
        Ok((created, skipped, latest_end))
    }

    fn window_start(
        &self,
        kind: SyncKind,
        previous: Option<&SyncCheckpoint>,
        now: Timestamp,
    ) -> Timestamp {
        match kind {
            SyncKind::Full => now - SignedDuration::from_hours(self.config.full_lookback_days * 24),
            SyncKind::Recent => {
                now - SignedDuration::from_hours(self.config.recent_lookback_hours)
            }
            SyncKind::Incremental => match previous {
                Some(cp) => {
                    cp.last_processed
                        - SignedDuration::from_hours(self.config.checkpoint_overlap_hours)
                }
                None => now - SignedDuration::from_hours(self.config.lookback_days * 24),
            },
        }
    }

    /// Progress and terminal checkpoint writes never fail the run; losing
    /// one only costs status visibility, not data.
    async fn write_checkpoint_best_effort(&self, checkpoint: &SyncCheckpoint) {
        if let Err(e) = self.storage.upsert_checkpoint(checkpoint.clone()).await {
            warn!(
                device_id = %checkpoint.device_id,
                error = %e,
                "checkpoint write failed"
            );
        }
    }
}

fn storage_err<E: std::error::Error>(e: E) -> SyncDeviceError {
    SyncDeviceError::Storage(e.to_string())
}

//! Merging upstream-reported trips with locally extracted ones.
//!
//! Upstream data wins wherever the two sources agree a trip happened;
//! local extraction only fills the gaps the provider's report missed.
//! Everything that survives the merge is checked against already-persisted
//! trips so a re-run over the same window inserts nothing new.

use jiff::SignedDuration;
use tracing::warn;
use ulid::Ulid;

use tripstream_core::{
    DeviceId, PositionSample, Trip, TripId, TripSource, geo, speed,
};

use crate::extract::TripThresholds;
use crate::upstream::TripReport;

/// Trips to persist plus the bookkeeping for everything that was not.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Sorted ascending by start time.
    pub accepted: Vec<Trip>,
    pub skipped_duplicate: u32,
    pub skipped_overlap: u32,
    pub skipped_ghost: u32,
}

impl ReconcileOutcome {
    pub fn skipped_total(&self) -> u32 {
        self.skipped_duplicate + self.skipped_overlap + self.skipped_ghost
    }
}

/// Reconcile both candidate sources against persisted trips.
///
/// `existing` must cover a window at least as wide as the candidates;
/// `samples` are the raw positions used for coordinate backfill.
pub fn reconcile(
    device_id: &DeviceId,
    upstream: Vec<TripReport>,
    local: Vec<Trip>,
    existing: &[Trip],
    samples: &[PositionSample],
    thresholds: &TripThresholds,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    // Providers occasionally report spurious zero-length trips; drop them
    // before they can shadow a real locally-extracted trip in the same
    // window. Trips with missing coordinates pass through here so the
    // backfill below gets a chance at them.
    let mut upstream_trips: Vec<Trip> = Vec::new();
    for report in upstream {
        let Some(trip) = report_to_trip(device_id, report) else {
            continue;
        };
        if !trip.has_missing_endpoint() && is_ghost(&trip, thresholds) {
            outcome.skipped_ghost += 1;
            continue;
        }
        upstream_trips.push(trip);
    }

    // Gap-fill: keep only local candidates that do not collide with any
    // surviving upstream trip.
    let mut candidates = upstream_trips;
    let upstream_count = candidates.len();
    for trip in local {
        let collides = candidates[..upstream_count]
            .iter()
            .any(|u| ranges_overlap(&trip, u));
        if !collides {
            candidates.push(trip);
        }
    }

    for candidate in &mut candidates {
        backfill_endpoints(candidate, samples, thresholds);
    }

    let start_window = SignedDuration::from_secs(thresholds.dedup_start_window_secs);
    let duration_tolerance = thresholds.dedup_duration_tolerance_secs;

    for candidate in candidates {
        let duplicate = existing
            .iter()
            .chain(outcome.accepted.iter())
            .any(|e| {
                e.started_at.duration_since(candidate.started_at).abs() <= start_window
                    && (e.duration_seconds - candidate.duration_seconds).abs()
                        <= duration_tolerance
            });
        if duplicate {
            outcome.skipped_duplicate += 1;
            continue;
        }

        let contained = existing.iter().any(|e| {
            e.started_at <= candidate.started_at && e.ended_at >= candidate.ended_at
        });
        if contained {
            outcome.skipped_overlap += 1;
            continue;
        }

        // Final ghost check regardless of source; this is what catches
        // locally-extracted ghosts the upstream pre-filter never saw.
        if is_ghost(&candidate, thresholds) {
            outcome.skipped_ghost += 1;
            continue;
        }

        outcome.accepted.push(candidate);
    }

    outcome.accepted.sort_by_key(|t| t.started_at);
    outcome
}

fn ranges_overlap(a: &Trip, b: &Trip) -> bool {
    a.started_at < b.ended_at && a.ended_at > b.started_at
}

fn is_ghost(trip: &Trip, thresholds: &TripThresholds) -> bool {
    trip.displacement_m() < thresholds.min_displacement_m
        && trip.distance_km < thresholds.round_trip_km
}

/// Turn a provider report into a trip record, or reject it as malformed.
fn report_to_trip(device_id: &DeviceId, report: TripReport) -> Option<Trip> {
    if report.ended_at <= report.started_at {
        warn!(
            device_id = %device_id,
            started_at = %report.started_at,
            ended_at = %report.ended_at,
            "discarding upstream trip with inverted time range"
        );
        return None;
    }

    let duration = report.ended_at.duration_since(report.started_at);
    let duration_seconds = (duration.as_millis() as f64 / 1000.0).round() as i64;

    Some(Trip {
        id: TripId(Ulid::new()),
        device_id: device_id.clone(),
        started_at: report.started_at,
        ended_at: report.ended_at,
        start_latitude: report.start_latitude.unwrap_or(0.0),
        start_longitude: report.start_longitude.unwrap_or(0.0),
        end_latitude: report.end_latitude.unwrap_or(0.0),
        end_longitude: report.end_longitude.unwrap_or(0.0),
        distance_km: report.distance_km.unwrap_or(0.0).max(0.0),
        max_speed_kmh: speed::normalize_kmh(report.max_speed.unwrap_or(0.0)),
        avg_speed_kmh: speed::normalize_kmh(report.avg_speed.unwrap_or(0.0)),
        duration_seconds,
        source: TripSource::UpstreamReport,
    })
}

/// Substitute missing (0,0) endpoints with the nearest-in-time real fix
/// around the endpoint's timestamp. When both endpoints were filled in and
/// the reported distance was zero, recompute it from the new endpoints.
fn backfill_endpoints(trip: &mut Trip, samples: &[PositionSample], thresholds: &TripThresholds) {
    let window = SignedDuration::from_secs(thresholds.backfill_window_secs);

    let mut filled_start = false;
    let mut filled_end = false;

    if trip.start_latitude == 0.0 && trip.start_longitude == 0.0 {
        if let Some(sample) = nearest_fix(samples, trip.started_at, window) {
            trip.start_latitude = sample.latitude;
            trip.start_longitude = sample.longitude;
            filled_start = true;
        }
    }

    if trip.end_latitude == 0.0 && trip.end_longitude == 0.0 {
        if let Some(sample) = nearest_fix(samples, trip.ended_at, window) {
            trip.end_latitude = sample.latitude;
            trip.end_longitude = sample.longitude;
            filled_end = true;
        }
    }

    if filled_start && filled_end && trip.distance_km == 0.0 {
        trip.distance_km = geo::haversine_km(
            trip.start_latitude,
            trip.start_longitude,
            trip.end_latitude,
            trip.end_longitude,
        );
    }
}

fn nearest_fix<'a>(
    samples: &'a [PositionSample],
    at: jiff::Timestamp,
    window: SignedDuration,
) -> Option<&'a PositionSample> {
    samples
        .iter()
        .filter(|s| {
            (s.latitude != 0.0 || s.longitude != 0.0)
                && s.timestamp.duration_since(at).abs() <= window
        })
        .min_by_key(|s| s.timestamp.duration_since(at).abs())
}

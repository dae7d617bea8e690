//! Trip extraction from raw position samples.
//!
//! Two strategies live behind one interface: ignition-transition detection
//! (preferred, when the window carries trustworthy ignition data) and a
//! speed-plus-displacement fallback. The choice is made once per window by
//! a capability check rather than branching sample-by-sample.

use jiff::SignedDuration;
use serde::Deserialize;
use tracing::debug;
use ulid::Ulid;

use tripstream_core::{
    DeviceId, IgnitionSource, IgnitionState, PositionSample, Trip, TripId, TripSource, geo, speed,
};

/// Empirically tuned extraction and reconciliation thresholds.
///
/// None of these have a first-principles derivation; they are deployment
/// tunables with defaults matching the upstream provider's conventions,
/// overridable from the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TripThresholds {
    /// Minimum ignition detection confidence for a trip-start trigger
    pub min_ignition_confidence: f64,
    /// Seconds below the movement speed before a trip is considered over
    pub idle_timeout_secs: i64,
    /// Sample gap treated as a data outage boundary, in seconds
    pub max_gap_secs: i64,
    /// Speed above which a vehicle counts as moving, km/h
    pub movement_speed_kmh: f64,
    /// Displacement required alongside speed for a fallback trip start, meters
    pub movement_distance_m: f64,
    /// Single segments longer than this are GPS error, not movement, km
    pub max_segment_km: f64,
    /// Trips with less accumulated path than this are noise, km
    pub min_trip_km: f64,
    /// Start/end closer than this counts as "no displacement", meters
    pub min_displacement_m: f64,
    /// Path distance that rescues a start≈end trip as a genuine round trip, km
    pub round_trip_km: f64,
    /// Speeds above this are excluded from max/avg aggregation, km/h
    pub speed_outlier_kmh: f64,
    /// Candidate start within this of an existing trip start may be a duplicate, seconds
    pub dedup_start_window_secs: i64,
    /// Duration tolerance for duplicate detection, seconds
    pub dedup_duration_tolerance_secs: i64,
    /// How far around a trip endpoint to look for a coordinate backfill, seconds
    pub backfill_window_secs: i64,
}

impl Default for TripThresholds {
    fn default() -> Self {
        Self {
            min_ignition_confidence: 0.5,
            idle_timeout_secs: 180,
            max_gap_secs: 1800,
            movement_speed_kmh: 5.0,
            movement_distance_m: 15.0,
            max_segment_km: 10.0,
            min_trip_km: 0.1,
            min_displacement_m: 50.0,
            round_trip_km: 0.5,
            speed_outlier_kmh: 200.0,
            dedup_start_window_secs: 300,
            dedup_duration_tolerance_secs: 120,
            backfill_window_secs: 900,
        }
    }
}

/// One way of segmenting a sample stream into candidate trips.
pub trait ExtractionStrategy {
    fn name(&self) -> &'static str;

    /// Produce candidate trips from samples sorted ascending by timestamp.
    fn extract(
        &self,
        device_id: &DeviceId,
        samples: &[PositionSample],
        thresholds: &TripThresholds,
    ) -> Vec<Trip>;
}

/// True when a sample's ignition reading is trustworthy enough to drive
/// trip boundaries. Speed-inferred ignition never qualifies; it reacts to
/// GPS jitter at parked vehicles.
fn ignition_qualifies(sample: &PositionSample, thresholds: &TripThresholds) -> bool {
    matches!(
        sample.ignition_source,
        IgnitionSource::HardwareBit | IgnitionSource::ParsedString
    ) && sample.ignition_confidence.unwrap_or(1.0) >= thresholds.min_ignition_confidence
}

/// Capability check used to select the strategy for a window.
pub fn window_has_ignition_data(samples: &[PositionSample], thresholds: &TripThresholds) -> bool {
    samples
        .iter()
        .any(|s| s.ignition != IgnitionState::Unknown && ignition_qualifies(s, thresholds))
}

/// Sort, pick a strategy and run it over one device's window.
pub fn extract_trips(
    device_id: &DeviceId,
    mut samples: Vec<PositionSample>,
    thresholds: &TripThresholds,
) -> Vec<Trip> {
    // Storage order is not guaranteed.
    samples.sort_by_key(|s| s.timestamp);

    let strategy: &dyn ExtractionStrategy = if window_has_ignition_data(&samples, thresholds) {
        &IgnitionStrategy
    } else {
        &SpeedStrategy
    };

    let trips = strategy.extract(device_id, &samples, thresholds);
    debug!(
        device_id = %device_id,
        strategy = strategy.name(),
        samples = samples.len(),
        trips = trips.len(),
        "extracted candidate trips"
    );
    trips
}

/// Ignition-transition segmentation, the preferred path.
///
/// A trip starts on an off/unknown-to-on transition with a qualifying
/// detection source, continues while ignition stays on regardless of
/// instantaneous speed (idling at a stoplight is still the same trip), and
/// ends on ignition off, a long idle, a data-outage gap, or stream end.
pub struct IgnitionStrategy;

impl ExtractionStrategy for IgnitionStrategy {
    fn name(&self) -> &'static str {
        "ignition"
    }

    fn extract(
        &self,
        device_id: &DeviceId,
        samples: &[PositionSample],
        thresholds: &TripThresholds,
    ) -> Vec<Trip> {
        let idle_timeout = SignedDuration::from_secs(thresholds.idle_timeout_secs);
        let max_gap = SignedDuration::from_secs(thresholds.max_gap_secs);

        let mut trips = Vec::new();
        let mut trip_start: Option<usize> = None;
        let mut idle_since: Option<jiff::Timestamp> = None;
        // Set when the previous trip was closed by the idle rule with
        // ignition still on; the journey splits there and the next leg may
        // begin without an off/on transition.
        let mut idle_closed = false;

        for (i, sample) in samples.iter().enumerate() {
            match trip_start {
                None => {
                    if sample.ignition == IgnitionState::Off {
                        idle_closed = false;
                    }
                    // The previous sample only counts as "already on" when
                    // it is close enough in time; across an outage gap the
                    // prior state is unknowable.
                    let was_on = i > 0
                        && samples[i - 1].ignition == IgnitionState::On
                        && sample.timestamp.duration_since(samples[i - 1].timestamp) <= max_gap;
                    let resumes = idle_closed
                        && speed::normalize_kmh(sample.speed_raw) > thresholds.movement_speed_kmh;
                    if sample.ignition == IgnitionState::On
                        && ignition_qualifies(sample, thresholds)
                        && (!was_on || resumes)
                    {
                        trip_start = Some(i);
                        idle_since = None;
                        idle_closed = false;
                    }
                }
                Some(start) => {
                    let mut end_here = false;

                    if sample.ignition == IgnitionState::Off {
                        end_here = true;
                    }

                    if !end_here {
                        let kmh = speed::normalize_kmh(sample.speed_raw);
                        if kmh < thresholds.movement_speed_kmh {
                            let since = *idle_since.get_or_insert(sample.timestamp);
                            if sample.timestamp.duration_since(since) > idle_timeout {
                                end_here = true;
                            }
                        } else {
                            idle_since = None;
                        }
                    }

                    // A long silence means a data outage, not a 30-minute
                    // red light; close the trip at the last sample seen.
                    let gap_follows = samples
                        .get(i + 1)
                        .is_some_and(|next| next.timestamp.duration_since(sample.timestamp) > max_gap);

                    if end_here || gap_follows || i == samples.len() - 1 {
                        if let Some(trip) =
                            build_trip(device_id, &samples[start..=i], thresholds)
                        {
                            trips.push(trip);
                        }
                        // An idle close with ignition still on is a split,
                        // not the end of the cycle; driving may resume.
                        idle_closed = end_here && sample.ignition == IgnitionState::On;
                        trip_start = None;
                        idle_since = None;
                    }
                }
            }
        }

        trips
    }
}

/// Speed-threshold fallback, used only when the window has no qualifying
/// ignition data at all.
///
/// Starting requires both speed above the movement threshold and real
/// displacement from the previous sample; requiring both keeps GPS jitter
/// at a parked vehicle from opening phantom trips.
pub struct SpeedStrategy;

impl ExtractionStrategy for SpeedStrategy {
    fn name(&self) -> &'static str {
        "speed"
    }

    fn extract(
        &self,
        device_id: &DeviceId,
        samples: &[PositionSample],
        thresholds: &TripThresholds,
    ) -> Vec<Trip> {
        let idle_timeout = SignedDuration::from_secs(thresholds.idle_timeout_secs);
        let max_gap = SignedDuration::from_secs(thresholds.max_gap_secs);

        let mut trips = Vec::new();
        let mut trip_start: Option<usize> = None;
        let mut idle_since: Option<jiff::Timestamp> = None;

        for (i, sample) in samples.iter().enumerate() {
            match trip_start {
                None => {
                    if i == 0 {
                        continue;
                    }
                    let prev = &samples[i - 1];
                    let kmh = speed::normalize_kmh(sample.speed_raw);
                    let moved_m = geo::haversine_m(
                        prev.latitude,
                        prev.longitude,
                        sample.latitude,
                        sample.longitude,
                    );
                    if kmh > thresholds.movement_speed_kmh
                        && moved_m > thresholds.movement_distance_m
                    {
                        // The trip began somewhere between the two samples;
                        // anchor it at the last stationary one.
                        trip_start = Some(i - 1);
                        idle_since = None;
                    }
                }
                Some(start) => {
                    let mut end_here = false;

                    let kmh = speed::normalize_kmh(sample.speed_raw);
                    if kmh < thresholds.movement_speed_kmh {
                        let since = *idle_since.get_or_insert(sample.timestamp);
                        if sample.timestamp.duration_since(since) > idle_timeout {
                            end_here = true;
                        }
                    } else {
                        idle_since = None;
                    }

                    let gap_follows = samples
                        .get(i + 1)
                        .is_some_and(|next| next.timestamp.duration_since(sample.timestamp) > max_gap);

                    if end_here || gap_follows || i == samples.len() - 1 {
                        if let Some(trip) =
                            build_trip(device_id, &samples[start..=i], thresholds)
                        {
                            trips.push(trip);
                        }
                        trip_start = None;
                        idle_since = None;
                    }
                }
            }
        }

        trips
    }
}

/// Aggregate one contiguous sample run into a candidate trip, or reject it
/// as noise.
fn build_trip(
    device_id: &DeviceId,
    window: &[PositionSample],
    thresholds: &TripThresholds,
) -> Option<Trip> {
    if window.len() < 2 {
        return None;
    }

    let first = &window[0];
    let last = &window[window.len() - 1];
    if last.timestamp <= first.timestamp {
        return None;
    }

    let mut distance_km = 0.0;
    for pair in window.windows(2) {
        let segment = geo::haversine_km(
            pair[0].latitude,
            pair[0].longitude,
            pair[1].latitude,
            pair[1].longitude,
        );
        // A single impossible jump is a bad fix, not real movement.
        if segment <= thresholds.max_segment_km {
            distance_km += segment;
        }
    }

    if distance_km < thresholds.min_trip_km {
        return None;
    }

    let displacement_m = geo::haversine_m(
        first.latitude,
        first.longitude,
        last.latitude,
        last.longitude,
    );
    // Start≈end with no real path behind it is GPS drift, not a journey;
    // a genuine round trip has the path distance to show for itself.
    if displacement_m < thresholds.min_displacement_m && distance_km < thresholds.round_trip_km {
        return None;
    }

    let mut max_speed_kmh = 0.0f64;
    let mut speed_sum = 0.0;
    let mut speed_count = 0u32;
    for sample in window {
        let kmh = speed::normalize_kmh(sample.speed_raw);
        if kmh > 0.0 && kmh <= thresholds.speed_outlier_kmh {
            max_speed_kmh = max_speed_kmh.max(kmh);
            speed_sum += kmh;
            speed_count += 1;
        }
    }
    let avg_speed_kmh = if speed_count > 0 {
        speed_sum / speed_count as f64
    } else {
        0.0
    };

    let duration = last.timestamp.duration_since(first.timestamp);
    let duration_seconds = (duration.as_millis() as f64 / 1000.0).round() as i64;

    Some(Trip {
        id: TripId(Ulid::new()),
        device_id: device_id.clone(),
        started_at: first.timestamp,
        ended_at: last.timestamp,
        start_latitude: first.latitude,
        start_longitude: first.longitude,
        end_latitude: last.latitude,
        end_longitude: last.longitude,
        distance_km,
        max_speed_kmh,
        avg_speed_kmh,
        duration_seconds,
        source: TripSource::LocallyExtracted,
    })
}

//! Canonical speed normalization.
//!
//! Device firmware is not consistent about speed units: most report km/h
//! directly, but some report centi-km/h (km/h scaled by 100), which shows
//! up as implausibly large magnitudes. Every consumer of sample speed goes
//! through [`normalize_kmh`] so that thresholds elsewhere in the pipeline
//! are always compared against the same unit.

/// Fastest speed we accept as a genuine road vehicle reading, in km/h.
pub const MAX_PLAUSIBLE_KMH: f64 = 400.0;

/// Convert a raw firmware speed reading into canonical km/h.
///
/// Total and deterministic: non-finite and non-positive inputs map to 0,
/// values above [`MAX_PLAUSIBLE_KMH`] are treated as centi-km/h and
/// rescaled, and the result is clamped into `0.0..=MAX_PLAUSIBLE_KMH`.
/// Idempotent: applying it to an already-normalized value is a no-op.
pub fn normalize_kmh(raw: f64) -> f64 {
    if !raw.is_finite() || raw <= 0.0 {
        return 0.0;
    }

    let kmh = if raw > MAX_PLAUSIBLE_KMH {
        raw / 100.0
    } else {
        raw
    };

    kmh.min(MAX_PLAUSIBLE_KMH)
}

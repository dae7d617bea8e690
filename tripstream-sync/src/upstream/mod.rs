pub mod http;
pub mod mock;

use async_trait::async_trait;
use serde::Deserialize;
use tripstream_core::DeviceId;

/// Provider status codes that signal throttling rather than a bad request.
/// These must take the backoff path, never the data-error path.
pub const RATE_LIMIT_CODES: [i32; 4] = [429, 1001, 1002, 10003];

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Provider signalled throttling; recoverable via backoff and retry.
    #[error("upstream throttled (code {code})")]
    RateLimited { code: i32 },
    /// Transport-level failure; recoverable with its own shorter backoff.
    #[error("network error: {0}")]
    Network(String),
    /// Malformed or unexpected response shape. Never retried.
    #[error("malformed upstream response: {0}")]
    Data(String),
    /// The rate-limited client gave up after its retry budget.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// One trip as reported by the provider, with times already resolved to
/// UTC. Downstream logic never sees the provider's raw time encodings.
#[derive(Debug, Clone)]
pub struct TripReport {
    pub started_at: jiff::Timestamp,
    pub ended_at: jiff::Timestamp,
    pub start_latitude: Option<f64>,
    pub start_longitude: Option<f64>,
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
    /// Accumulated distance in km, when the provider reports one.
    pub distance_km: Option<f64>,
    /// Raw speed figures in the provider's unit; normalize before use.
    pub max_speed: Option<f64>,
    pub avg_speed: Option<f64>,
}

/// Provider times arrive in one of two encodings depending on the response
/// version: epoch milliseconds, or a local-time string qualified by the
/// query's UTC offset. Resolved exactly once, at this boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReportTime {
    EpochMillis(i64),
    Localized(String),
}

impl ReportTime {
    pub fn resolve(&self, utc_offset_minutes: i32) -> Result<jiff::Timestamp, UpstreamError> {
        match self {
            ReportTime::EpochMillis(ms) => jiff::Timestamp::from_millisecond(*ms)
                .map_err(|e| UpstreamError::Data(format!("epoch millis {ms} out of range: {e}"))),
            ReportTime::Localized(s) => {
                // Some response versions carry a full RFC 3339 instant.
                if let Ok(ts) = s.parse::<jiff::Timestamp>() {
                    return Ok(ts);
                }

                let dt = jiff::civil::DateTime::strptime("%Y-%m-%d %H:%M:%S", s)
                    .map_err(|e| UpstreamError::Data(format!("bad time string {s:?}: {e}")))?;
                let offset = jiff::tz::Offset::from_seconds(utc_offset_minutes * 60)
                    .map_err(|e| UpstreamError::Data(format!("bad utc offset: {e}")))?;
                offset
                    .to_timestamp(dt)
                    .map_err(|e| UpstreamError::Data(format!("unrepresentable time {s:?}: {e}")))
            }
        }
    }
}

/// Raw trip record as deserialized from the provider response body.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTripReport {
    pub start_time: ReportTime,
    pub end_time: ReportTime,
    #[serde(default)]
    pub start_latitude: Option<f64>,
    #[serde(default)]
    pub start_longitude: Option<f64>,
    #[serde(default)]
    pub end_latitude: Option<f64>,
    #[serde(default)]
    pub end_longitude: Option<f64>,
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default)]
    pub max_speed: Option<f64>,
    #[serde(default)]
    pub avg_speed: Option<f64>,
}

impl RawTripReport {
    pub fn resolve(self, utc_offset_minutes: i32) -> Result<TripReport, UpstreamError> {
        Ok(TripReport {
            started_at: self.start_time.resolve(utc_offset_minutes)?,
            ended_at: self.end_time.resolve(utc_offset_minutes)?,
            start_latitude: self.start_latitude,
            start_longitude: self.start_longitude,
            end_latitude: self.end_latitude,
            end_longitude: self.end_longitude,
            distance_km: self.distance_km,
            max_speed: self.max_speed,
            avg_speed: self.avg_speed,
        })
    }
}

/// The single upstream operation this pipeline needs: list trips the
/// provider itself recorded for a device inside a time window.
///
/// Raw positions are deliberately not part of this trait; they are a
/// local-storage read with no rate limit.
#[async_trait]
pub trait UpstreamProvider: Send + Sync + 'static {
    async fn fetch_trip_reports(
        &self,
        device_id: &DeviceId,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<Vec<TripReport>, UpstreamError>;
}

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tripstream_core::DeviceId;

use crate::upstream::{RATE_LIMIT_CODES, RawTripReport, TripReport, UpstreamError, UpstreamProvider};

/// Telematics provider client over HTTP.
///
/// This issues the raw request/response exchange only; pacing, backoff and
/// retries live in [`crate::ratelimit::RateLimitedClient`], which wraps
/// this provider.
pub struct HttpProvider {
    http: reqwest::Client,
    base_url: String,
    token: String,
    utc_offset_minutes: i32,
}

/// Provider response envelope: a small integer status code plus records.
#[derive(Debug, Deserialize)]
struct TripReportResponse {
    code: i32,
    #[serde(default)]
    records: Vec<RawTripReport>,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, utc_offset_minutes: i32) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            utc_offset_minutes,
        }
    }
}

#[async_trait]
impl UpstreamProvider for HttpProvider {
    async fn fetch_trip_reports(
        &self,
        device_id: &DeviceId,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<Vec<TripReport>, UpstreamError> {
        let body = json!({
            "token": self.token,
            "device_id": device_id.as_str(),
            "start_time": start.as_millisecond(),
            "end_time": end.as_millisecond(),
            "utc_offset_minutes": self.utc_offset_minutes,
        });

        let response = self
            .http
            .post(format!("{}/api/trips/report", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let http_status = response.status();
        if http_status.as_u16() == 429 {
            return Err(UpstreamError::RateLimited { code: 429 });
        }
        if http_status.is_server_error() {
            return Err(UpstreamError::Network(format!(
                "upstream returned {http_status}"
            )));
        }

        let envelope: TripReportResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Data(e.to_string()))?;

        if RATE_LIMIT_CODES.contains(&envelope.code) {
            return Err(UpstreamError::RateLimited {
                code: envelope.code,
            });
        }
        if envelope.code != 0 {
            return Err(UpstreamError::Data(format!(
                "provider status code {}",
                envelope.code
            )));
        }

        envelope
            .records
            .into_iter()
            .map(|raw| raw.resolve(self.utc_offset_minutes))
            .collect()
    }
}

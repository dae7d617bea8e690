use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tripstream_core::DeviceId;

use crate::upstream::{TripReport, UpstreamError, UpstreamProvider};

/// Canned upstream provider for local runs and tests.
///
/// Serves pre-loaded trip reports filtered to the requested window, and can
/// be told to throttle the next N calls to exercise the backoff path.
#[derive(Clone, Default)]
pub struct MockProvider {
    reports: Arc<Mutex<HashMap<DeviceId, Vec<TripReport>>>>,
    throttle_next: Arc<AtomicU32>,
    calls: Arc<AtomicU32>,
}

impl MockProvider {
    pub fn push_report(&self, device_id: DeviceId, report: TripReport) {
        let mut reports = self.reports.lock().unwrap_or_else(|e| e.into_inner());
        reports.entry(device_id).or_default().push(report);
    }

    /// Make the next `n` calls fail with a throttling code.
    pub fn throttle_next(&self, n: u32) {
        self.throttle_next.store(n, Ordering::SeqCst);
    }

    /// Total calls issued against this provider.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamProvider for MockProvider {
    async fn fetch_trip_reports(
        &self,
        device_id: &DeviceId,
        start: jiff::Timestamp,
        end: jiff::Timestamp,
    ) -> Result<Vec<TripReport>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.throttle_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.throttle_next.store(remaining - 1, Ordering::SeqCst);
            return Err(UpstreamError::RateLimited { code: 429 });
        }

        let reports = self.reports.lock().unwrap_or_else(|e| e.into_inner());
        Ok(reports
            .get(device_id)
            .map(|all| {
                all.iter()
                    .filter(|r| r.started_at <= end && r.ended_at >= start)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};
use tripstream_core::{DeviceId, RateLimitState};

use crate::storage::RateLimitStore;
use crate::upstream::{TripReport, UpstreamError, UpstreamProvider};

/// Pacing and retry tuning for the upstream client.
///
/// The defaults match the provider's published budget: ~3 requests per
/// second with at least 350ms between calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Minimum delay between any two upstream calls, in milliseconds
    pub min_interval_ms: u64,
    /// Maximum calls inside one rolling burst window
    pub burst_limit: u32,
    /// Length of the burst window, in milliseconds
    pub burst_window_ms: u64,
    /// First backoff after a throttling error, in milliseconds
    pub backoff_base_ms: u64,
    /// Ceiling for the throttling backoff, in milliseconds
    pub backoff_cap_ms: u64,
    /// Retries after throttling errors before giving up
    pub max_retries: u32,
    /// First backoff after a network error, in milliseconds
    pub network_backoff_base_ms: u64,
    /// Ceiling for the network backoff, in milliseconds
    pub network_backoff_cap_ms: u64,
    /// Retries after network errors before giving up
    pub network_max_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 350,
            burst_limit: 3,
            burst_window_ms: 1000,
            backoff_base_ms: 2000,
            backoff_cap_ms: 60_000,
            max_retries: 3,
            network_backoff_base_ms: 500,
            network_backoff_cap_ms: 5000,
            network_max_retries: 3,
        }
    }
}

/// Upstream provider wrapper enforcing the shared request budget.
///
/// All pacing state lives in the [`RateLimitStore`], not in this struct:
/// the pipeline runs as multiple independent invocations against one
/// provider quota, so a backoff observed by any one of them must be
/// visible to all. The in-memory copy is only ever a snapshot.
pub struct RateLimitedClient<P, R> {
    provider: P,
    store: R,
    config: RateLimitConfig,
}

impl<P, R> RateLimitedClient<P, R>
where
    P: UpstreamProvider,
    R: RateLimitStore,
{
    pub fn new(provider: P, store: R, config: RateLimitConfig) -> Self {
        Self {
            provider,
            store,
            config,
        }
    }

    /// Fetch trip reports for a device, waiting out any shared backoff and
    /// pacing constraints, and retrying throttling and network failures on
    /// independent budgets.
    ///
    /// Retry is a bounded loop with explicit attempt counters; after either
    /// budget is exhausted the last error surfaces as `RetriesExhausted`.
    pub async fn fetch_trip_reports(
        &self,
        device_id: &DeviceId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<TripReport>, UpstreamError> {
        let mut throttle_attempts = 0u32;
        let mut network_attempts = 0u32;

        loop {
            self.wait_for_slot().await?;

            match self.provider.fetch_trip_reports(device_id, start, end).await {
                Ok(reports) => {
                    self.clear_backoff().await?;
                    return Ok(reports);
                }
                Err(UpstreamError::RateLimited { code }) => {
                    throttle_attempts += 1;
                    let backoff = exponential_backoff(
                        self.config.backoff_base_ms,
                        self.config.backoff_cap_ms,
                        throttle_attempts,
                    );

                    // Persist before anything else so concurrent callers
                    // start honoring the cooldown immediately.
                    self.extend_backoff(backoff).await?;

                    if throttle_attempts > self.config.max_retries {
                        return Err(UpstreamError::RetriesExhausted {
                            attempts: throttle_attempts,
                            last: format!("throttled (code {code})"),
                        });
                    }

                    warn!(
                        device_id = %device_id,
                        code,
                        backoff_ms = backoff.as_millis() as u64,
                        attempt = throttle_attempts,
                        "upstream throttled, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(UpstreamError::Network(message)) => {
                    network_attempts += 1;
                    if network_attempts > self.config.network_max_retries {
                        return Err(UpstreamError::RetriesExhausted {
                            attempts: network_attempts,
                            last: message,
                        });
                    }

                    // Network hiccups are ours alone; they do not extend
                    // the shared cooldown.
                    let backoff = exponential_backoff(
                        self.config.network_backoff_base_ms,
                        self.config.network_backoff_cap_ms,
                        network_attempts,
                    );
                    warn!(
                        device_id = %device_id,
                        error = %message,
                        backoff_ms = backoff.as_millis() as u64,
                        attempt = network_attempts,
                        "upstream network error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                // Malformed responses are not retried.
                Err(err) => return Err(err),
            }
        }
    }

    /// Block until the shared state permits one more call, then claim the
    /// slot by writing the updated state back.
    async fn wait_for_slot(&self) -> Result<(), UpstreamError> {
        loop {
            let now = Timestamp::now();
            let state = self.load_state().await?;

            let mut wait = Duration::ZERO;

            if let Some(until) = state.backoff_until
                && until > now
            {
                wait = wait.max(until.duration_since(now).unsigned_abs());
            }

            if let Some(last) = state.last_call_at {
                let min_interval = SignedDuration::from_millis(self.config.min_interval_ms as i64);
                let since = now.duration_since(last);
                if since < min_interval {
                    wait = wait.max((min_interval - since).unsigned_abs());
                }
            }

            let burst_window = SignedDuration::from_millis(self.config.burst_window_ms as i64);
            if let Some(window_start) = state.window_started_at {
                let elapsed = now.duration_since(window_start);
                if elapsed < burst_window && state.calls_in_window >= self.config.burst_limit {
                    wait = wait.max((burst_window - elapsed).unsigned_abs());
                }
            }

            if !wait.is_zero() {
                debug!(wait_ms = wait.as_millis() as u64, "waiting for upstream slot");
                tokio::time::sleep(wait).await;
                continue;
            }

            let mut next = state;
            next.last_call_at = Some(now);
            match next.window_started_at {
                Some(window_start) if now.duration_since(window_start) < burst_window => {
                    next.calls_in_window += 1;
                }
                _ => {
                    next.window_started_at = Some(now);
                    next.calls_in_window = 1;
                }
            }
            self.store_state(next).await?;

            return Ok(());
        }
    }

    async fn clear_backoff(&self) -> Result<(), UpstreamError> {
        let mut state = self.load_state().await?;
        if state.backoff_until.is_some() {
            state.backoff_until = None;
            self.store_state(state).await?;
        }
        Ok(())
    }

    async fn extend_backoff(&self, backoff: Duration) -> Result<(), UpstreamError> {
        let until = Timestamp::now() + SignedDuration::from_millis(backoff.as_millis() as i64);
        let mut state = self.load_state().await?;
        state.backoff_until = Some(until);
        self.store_state(state).await?;
        Ok(())
    }

    async fn load_state(&self) -> Result<RateLimitState, UpstreamError> {
        self.store
            .load_rate_limit()
            .await
            .map_err(|e| UpstreamError::Network(format!("rate limit state load: {e}")))
    }

    async fn store_state(&self, state: RateLimitState) -> Result<(), UpstreamError> {
        self.store
            .store_rate_limit(state)
            .await
            .map_err(|e| UpstreamError::Network(format!("rate limit state store: {e}")))
    }
}

/// Capped exponential backoff with a little jitter so concurrent callers
/// don't thunder back in lockstep.
fn exponential_backoff(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let jitter = rand::rng().random_range(0..=base_ms / 4 + 1);
    Duration::from_millis(exp.min(cap_ms) + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::upstream::mock::MockProvider;

    fn fast_config() -> RateLimitConfig {
        RateLimitConfig {
            min_interval_ms: 5,
            burst_limit: 3,
            burst_window_ms: 50,
            backoff_base_ms: 120,
            backoff_cap_ms: 1000,
            max_retries: 2,
            network_backoff_base_ms: 10,
            network_backoff_cap_ms: 50,
            network_max_retries: 1,
        }
    }

    fn device() -> DeviceId {
        DeviceId::new("86412345678")
    }

    #[tokio::test]
    async fn retries_throttling_then_succeeds() {
        let storage = MemoryStorage::default();
        let provider = MockProvider::default();
        provider.throttle_next(1);

        let client = RateLimitedClient::new(provider.clone(), storage, fast_config());
        let now = Timestamp::now();
        let reports = client
            .fetch_trip_reports(&device(), now - SignedDuration::from_hours(1), now)
            .await
            .unwrap();

        assert!(reports.is_empty());
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let storage = MemoryStorage::default();
        let provider = MockProvider::default();
        provider.throttle_next(10);

        let client = RateLimitedClient::new(provider.clone(), storage, fast_config());
        let now = Timestamp::now();
        let err = client
            .fetch_trip_reports(&device(), now - SignedDuration::from_hours(1), now)
            .await
            .unwrap_err();

        assert!(matches!(err, UpstreamError::RetriesExhausted { .. }));
        // max_retries = 2 means 3 attempts total.
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn backoff_is_honored_by_other_clients() {
        let storage = MemoryStorage::default();

        // First client exhausts its budget against a throttling provider,
        // leaving a persisted backoff behind.
        let throttled = MockProvider::default();
        throttled.throttle_next(10);
        let config = RateLimitConfig {
            max_retries: 0,
            ..fast_config()
        };
        let client_a = RateLimitedClient::new(throttled, storage.clone(), config.clone());
        let now = Timestamp::now();
        let window_start = now - SignedDuration::from_hours(1);
        let _ = client_a
            .fetch_trip_reports(&device(), window_start, now)
            .await
            .unwrap_err();

        let state = crate::storage::RateLimitStore::load_rate_limit(&storage)
            .await
            .unwrap();
        let until = state.backoff_until.expect("backoff must be persisted");
        assert!(until > Timestamp::now());

        // A second, independent client over the same store must wait the
        // cooldown out before its call goes through.
        let healthy = MockProvider::default();
        let client_b = RateLimitedClient::new(healthy, storage.clone(), fast_config());
        let started = std::time::Instant::now();
        client_b
            .fetch_trip_reports(&device(), window_start, now)
            .await
            .unwrap();
        let remaining = until.duration_since(now).unsigned_abs();
        assert!(
            started.elapsed() >= remaining / 2,
            "second client should have waited out the shared backoff"
        );
    }

    #[tokio::test]
    async fn success_clears_backoff() {
        let storage = MemoryStorage::default();
        let provider = MockProvider::default();
        provider.throttle_next(1);

        let client = RateLimitedClient::new(provider, storage.clone(), fast_config());
        let now = Timestamp::now();
        client
            .fetch_trip_reports(&device(), now - SignedDuration::from_hours(1), now)
            .await
            .unwrap();

        let state = crate::storage::RateLimitStore::load_rate_limit(&storage)
            .await
            .unwrap();
        assert!(state.backoff_until.is_none());
    }
}

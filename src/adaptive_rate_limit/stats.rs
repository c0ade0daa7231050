use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Rolling counters and live rate targets of one endpoint.
///
/// The window counters (`success_count`, `failure_count`, `throttle_count`) only
/// grow between adjustment boundaries and are reset at each boundary. The
/// lifetime totals are never reset and exist for observability.
#[derive(Clone, Debug)]
pub struct EndpointStats {
    endpoint_name: String,
    success_count: u64,
    failure_count: u64,
    throttle_count: u64,
    current_requests_per_minute: f64,
    current_tokens_per_minute: f64,
    last_adjustment: Instant,

    total_successes: u64,
    total_failures: u64,
    total_throttles: u64,
    total_tokens_used: u64,
    acquisitions_granted: u64,
    acquisitions_rejected: u64,
    total_wait: Duration,
}

impl EndpointStats {
    pub(crate) fn new(
        endpoint_name: impl Into<String>,
        requests_per_minute: f64,
        tokens_per_minute: f64,
        now: Instant,
    ) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            success_count: 0,
            failure_count: 0,
            throttle_count: 0,
            current_requests_per_minute: requests_per_minute,
            current_tokens_per_minute: tokens_per_minute,
            last_adjustment: now,
            total_successes: 0,
            total_failures: 0,
            total_throttles: 0,
            total_tokens_used: 0,
            acquisitions_granted: 0,
            acquisitions_rejected: 0,
            total_wait: Duration::ZERO,
        }
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    pub fn throttle_count(&self) -> u64 {
        self.throttle_count
    }

    pub fn current_requests_per_minute(&self) -> f64 {
        self.current_requests_per_minute
    }

    pub fn current_tokens_per_minute(&self) -> f64 {
        self.current_tokens_per_minute
    }

    pub fn last_adjustment(&self) -> Instant {
        self.last_adjustment
    }

    /// Observations recorded in the current window.
    pub fn window_samples(&self) -> u64 {
        self.success_count + self.failure_count + self.throttle_count
    }

    /// Share of successes in the current window, `None` while it is empty.
    pub fn success_rate(&self) -> Option<f64> {
        match self.window_samples() {
            0 => None,
            samples => Some(self.success_count as f64 / samples as f64),
        }
    }

    /// Mean time granted acquisitions spent waiting for capacity.
    pub fn average_wait(&self) -> Duration {
        match u32::try_from(self.acquisitions_granted) {
            Ok(0) => Duration::ZERO,
            Ok(granted) => self.total_wait / granted,
            Err(_) => Duration::from_secs_f64(
                self.total_wait.as_secs_f64() / self.acquisitions_granted as f64,
            ),
        }
    }

    pub(crate) fn record_success(&mut self, tokens_used: Option<u64>) {
        self.success_count += 1;
        self.total_successes += 1;
        if let Some(tokens) = tokens_used {
            self.total_tokens_used = self.total_tokens_used.saturating_add(tokens);
        }
    }

    pub(crate) fn record_failure(&mut self) {
        self.failure_count += 1;
        self.total_failures += 1;
    }

    pub(crate) fn record_throttled(&mut self) {
        self.throttle_count += 1;
        self.total_throttles += 1;
    }

    pub(crate) fn record_granted(&mut self, waited: Duration) {
        self.acquisitions_granted += 1;
        self.total_wait = self.total_wait.saturating_add(waited);
    }

    pub(crate) fn record_rejected(&mut self) {
        self.acquisitions_rejected += 1;
    }

    /// Closes the current window with the given rates.
    pub(crate) fn start_window(&mut self, requests_per_minute: f64, tokens_per_minute: f64, now: Instant) {
        self.current_requests_per_minute = requests_per_minute;
        self.current_tokens_per_minute = tokens_per_minute;
        self.success_count = 0;
        self.failure_count = 0;
        self.throttle_count = 0;
        self.last_adjustment = now;
    }

    pub(crate) fn status(&self, request_capacity: f64, token_capacity: f64, now: Instant) -> EndpointStatus {
        EndpointStatus {
            endpoint_name: self.endpoint_name.clone(),
            success_count: self.success_count,
            failure_count: self.failure_count,
            throttle_count: self.throttle_count,
            current_requests_per_minute: self.current_requests_per_minute,
            current_tokens_per_minute: self.current_tokens_per_minute,
            since_last_adjustment: now.saturating_duration_since(self.last_adjustment),
            request_capacity,
            token_capacity,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_throttles: self.total_throttles,
            total_tokens_used: self.total_tokens_used,
            acquisitions_granted: self.acquisitions_granted,
            acquisitions_rejected: self.acquisitions_rejected,
            average_wait: self.average_wait(),
        }
    }
}

/// Read-only snapshot of an endpoint, as returned by
/// [`AdaptiveRateLimiter::status`](super::AdaptiveRateLimiter::status).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EndpointStatus {
    pub endpoint_name: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub throttle_count: u64,
    pub current_requests_per_minute: f64,
    pub current_tokens_per_minute: f64,
    pub since_last_adjustment: Duration,
    /// Requests that could be admitted right now.
    pub request_capacity: f64,
    /// Tokens that could be admitted right now.
    pub token_capacity: f64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_throttles: u64,
    pub total_tokens_used: u64,
    pub acquisitions_granted: u64,
    pub acquisitions_rejected: u64,
    pub average_wait: Duration,
}

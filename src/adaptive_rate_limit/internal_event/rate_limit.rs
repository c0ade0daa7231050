use metrics::{counter, gauge, histogram};

use super::{MetricsSink, RateLimitEvent};
use crate::Error as CrateError;

/// Forwards events to whatever recorder is installed for the `metrics` facade
/// (Prometheus exporter, statsd, ...). Every series carries an `endpoint` label.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsRecorderSink;

impl MetricsSink for MetricsRecorderSink {
    fn emit(&self, event: &RateLimitEvent<'_>) -> Result<(), CrateError> {
        let endpoint = event.endpoint().to_owned();
        match *event {
            RateLimitEvent::AcquisitionGranted { waited, .. } => {
                counter!("rate_limiter_acquisitions_granted_total", "endpoint" => endpoint.clone())
                    .increment(1);
                histogram!("rate_limiter_acquire_wait_seconds", "endpoint" => endpoint)
                    .record(waited);
            }
            RateLimitEvent::AcquisitionRejected { reason, .. } => {
                counter!(
                    "rate_limiter_acquisitions_rejected_total",
                    "endpoint" => endpoint,
                    "reason" => reason.as_str()
                )
                .increment(1);
            }
            RateLimitEvent::Success { .. } => {
                counter!("rate_limiter_successes_total", "endpoint" => endpoint).increment(1);
            }
            RateLimitEvent::Failure { .. } => {
                counter!("rate_limiter_failures_total", "endpoint" => endpoint).increment(1);
            }
            RateLimitEvent::Throttled { .. } => {
                counter!("rate_limiter_throttles_total", "endpoint" => endpoint).increment(1);
            }
            RateLimitEvent::RateAdjusted {
                requests_per_minute,
                tokens_per_minute,
                ..
            } => {
                gauge!("rate_limiter_requests_per_minute", "endpoint" => endpoint.clone())
                    .set(requests_per_minute);
                gauge!("rate_limiter_tokens_per_minute", "endpoint" => endpoint)
                    .set(tokens_per_minute);
            }
            RateLimitEvent::BucketCapacity {
                requests, tokens, ..
            } => {
                gauge!("rate_limiter_request_bucket_capacity", "endpoint" => endpoint.clone())
                    .set(requests);
                gauge!("rate_limiter_token_bucket_capacity", "endpoint" => endpoint).set(tokens);
            }
            RateLimitEvent::RetryScheduled { .. } => {
                counter!("rate_limiter_retries_total", "endpoint" => endpoint).increment(1);
            }
        }
        Ok(())
    }
}

/// Writes every event as a log line under the `adaptive_rate_limit::metrics` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn emit(&self, event: &RateLimitEvent<'_>) -> Result<(), CrateError> {
        match *event {
            RateLimitEvent::AcquisitionGranted { endpoint, waited } => {
                tracing::debug!(
                    target: "adaptive_rate_limit::metrics",
                    endpoint,
                    waited_ms = waited.as_millis() as u64,
                    "Acquisition Granted"
                );
            }
            RateLimitEvent::AcquisitionRejected { endpoint, reason } => {
                tracing::debug!(
                    target: "adaptive_rate_limit::metrics",
                    endpoint,
                    reason = reason.as_str(),
                    "Acquisition Rejected"
                );
            }
            RateLimitEvent::Success { endpoint } => {
                tracing::trace!(target: "adaptive_rate_limit::metrics", endpoint, "Success Recorded");
            }
            RateLimitEvent::Failure { endpoint } => {
                tracing::debug!(target: "adaptive_rate_limit::metrics", endpoint, "Failure Recorded");
            }
            RateLimitEvent::Throttled { endpoint } => {
                tracing::debug!(target: "adaptive_rate_limit::metrics", endpoint, "Throttle Recorded");
            }
            RateLimitEvent::RateAdjusted {
                endpoint,
                requests_per_minute,
                tokens_per_minute,
            } => {
                tracing::info!(
                    target: "adaptive_rate_limit::metrics",
                    endpoint,
                    requests_per_minute,
                    tokens_per_minute,
                    "Rate Adjusted"
                );
            }
            RateLimitEvent::BucketCapacity {
                endpoint,
                requests,
                tokens,
            } => {
                tracing::trace!(
                    target: "adaptive_rate_limit::metrics",
                    endpoint,
                    request_capacity = requests,
                    token_capacity = tokens,
                    "Bucket Capacity"
                );
            }
            RateLimitEvent::RetryScheduled {
                endpoint,
                attempt,
                delay,
            } => {
                tracing::debug!(
                    target: "adaptive_rate_limit::metrics",
                    endpoint,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retry Scheduled"
                );
            }
        }
        Ok(())
    }
}

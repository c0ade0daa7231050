//! Observability events emitted by the limiter and the executor.
//!
//! The core only talks to the [`MetricsSink`] trait. Sinks must not block; an
//! error returned by a sink is logged and dropped, it never aborts admission.

mod rate_limit;

use std::time::Duration;

pub use rate_limit::{MetricsRecorderSink, TracingSink};

use crate::Error as CrateError;

/// Why an acquisition was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The request is larger than the bucket can ever hold.
    ExceedsBurst,
    /// The required wait exceeded `max_wait`.
    WaitTooLong,
    /// Capacity was taken by another caller after waiting, twice.
    Contended,
}

impl RejectReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ExceedsBurst => "exceeds_burst",
            RejectReason::WaitTooLong => "wait_too_long",
            RejectReason::Contended => "contended",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RateLimitEvent<'a> {
    AcquisitionGranted {
        endpoint: &'a str,
        waited: Duration,
    },
    AcquisitionRejected {
        endpoint: &'a str,
        reason: RejectReason,
    },
    Success {
        endpoint: &'a str,
    },
    Failure {
        endpoint: &'a str,
    },
    Throttled {
        endpoint: &'a str,
    },
    RateAdjusted {
        endpoint: &'a str,
        requests_per_minute: f64,
        tokens_per_minute: f64,
    },
    BucketCapacity {
        endpoint: &'a str,
        requests: f64,
        tokens: f64,
    },
    RetryScheduled {
        endpoint: &'a str,
        attempt: usize,
        delay: Duration,
    },
}

impl RateLimitEvent<'_> {
    pub fn endpoint(&self) -> &str {
        match self {
            RateLimitEvent::AcquisitionGranted { endpoint, .. }
            | RateLimitEvent::AcquisitionRejected { endpoint, .. }
            | RateLimitEvent::Success { endpoint }
            | RateLimitEvent::Failure { endpoint }
            | RateLimitEvent::Throttled { endpoint }
            | RateLimitEvent::RateAdjusted { endpoint, .. }
            | RateLimitEvent::BucketCapacity { endpoint, .. }
            | RateLimitEvent::RetryScheduled { endpoint, .. } => *endpoint,
        }
    }
}

/// Destination for rate limiter counters and gauges.
pub trait MetricsSink: Send + Sync + 'static {
    fn emit(&self, event: &RateLimitEvent<'_>) -> Result<(), CrateError>;
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn emit(&self, _event: &RateLimitEvent<'_>) -> Result<(), CrateError> {
        Ok(())
    }
}

/// Hands an event to `sink`, logging instead of propagating a failure.
pub(crate) fn emit(sink: &dyn MetricsSink, event: RateLimitEvent<'_>) {
    if let Err(error) = sink.emit(&event) {
        warn!(
            message = "Metrics sink failed; dropping event.",
            endpoint = event.endpoint(),
            %error,
        );
    }
}

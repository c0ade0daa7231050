use std::sync::Mutex;

use crate::{
    Error as CrateError,
    adaptive_rate_limit::{MetricsSink, RateLimitEvent},
};

pub fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Keeps the kind of every event it receives; optionally reports each emission as failed.
#[derive(Debug, Default)]
pub struct RecordingSink {
    kinds: Mutex<Vec<&'static str>>,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            kinds: Mutex::default(),
            fail: true,
        }
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds
            .lock()
            .unwrap()
            .iter()
            .filter(|recorded| **recorded == kind)
            .count()
    }
}

impl MetricsSink for RecordingSink {
    fn emit(&self, event: &RateLimitEvent<'_>) -> Result<(), CrateError> {
        let kind = match event {
            RateLimitEvent::AcquisitionGranted { .. } => "granted",
            RateLimitEvent::AcquisitionRejected { .. } => "rejected",
            RateLimitEvent::Success { .. } => "success",
            RateLimitEvent::Failure { .. } => "failure",
            RateLimitEvent::Throttled { .. } => "throttled",
            RateLimitEvent::RateAdjusted { .. } => "rate_adjusted",
            RateLimitEvent::BucketCapacity { .. } => "bucket_capacity",
            RateLimitEvent::RetryScheduled { .. } => "retry_scheduled",
        };
        self.kinds.lock().unwrap().push(kind);

        if self.fail {
            return Err("metrics backend unavailable".into());
        }
        Ok(())
    }
}

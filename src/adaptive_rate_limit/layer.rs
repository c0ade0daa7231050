use tower::Layer;

use super::{AdaptiveRateLimit, BackoffExecutor};

/// Wraps services in [`AdaptiveRateLimit`], sharing one executor (and so one
/// limiter) between every service it produces.
#[derive(Clone, Debug)]
pub struct AdaptiveRateLimitLayer {
    executor: BackoffExecutor,
}

impl AdaptiveRateLimitLayer {
    pub fn new(executor: BackoffExecutor) -> Self {
        Self { executor }
    }
}

impl<S> Layer<S> for AdaptiveRateLimitLayer {
    type Service = AdaptiveRateLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdaptiveRateLimit::new(inner, self.executor.clone())
    }
}

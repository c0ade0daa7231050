use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::{Service, ServiceExt};

use super::{BackoffExecutor, Outcome, RateLimitError};
use crate::Error as CrateError;

/// A request that knows which endpoint it targets and roughly what it costs.
pub trait RateLimitedRequest {
    fn endpoint(&self) -> &str;

    /// Tokens reserved before the request is sent. Overestimates only cost
    /// throughput; the actual usage is reported back from the response.
    fn estimated_tokens(&self) -> u64;
}

/// A [`Service`] that runs every request through a [`BackoffExecutor`].
///
/// The inner service classifies each call into an [`Outcome`]; an `Err` from it
/// is treated as a transient failure. The inner service is cloned for every
/// attempt, and each attempt waits for that clone to become ready.
#[derive(Clone, Debug)]
pub struct AdaptiveRateLimit<S> {
    inner: S,
    executor: BackoffExecutor,
}

impl<S> AdaptiveRateLimit<S> {
    pub fn new(inner: S, executor: BackoffExecutor) -> Self {
        Self { inner, executor }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn executor(&self) -> &BackoffExecutor {
        &self.executor
    }
}

impl<S, Request, T> Service<Request> for AdaptiveRateLimit<S>
where
    Request: RateLimitedRequest + Clone + Send + 'static,
    S: Service<Request, Response = Outcome<T>> + Clone + Send + 'static,
    S::Error: Into<CrateError>,
    S::Future: Send,
    T: Send + 'static,
{
    type Response = T;
    type Error = RateLimitError;
    type Future = BoxFuture<'static, Result<T, RateLimitError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Admission happens inside the call, where the wait can be bounded.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let inner = self.inner.clone();
        let executor = self.executor.clone();

        Box::pin(async move {
            let endpoint = request.endpoint().to_owned();
            let estimated_tokens = request.estimated_tokens();

            executor
                .execute(&endpoint, estimated_tokens, move |_| {
                    let inner = inner.clone();
                    let request = request.clone();
                    async move {
                        match inner.oneshot(request).await {
                            Ok(outcome) => outcome,
                            Err(error) => Outcome::transient(error),
                        }
                    }
                })
                .await
        })
    }
}

use std::time::Duration;

use crate::Error as CrateError;

/// Classified result of one call to the remote.
///
/// The adapter at the network boundary (see
/// [`reqwest_integration`](super::reqwest_integration)) builds this once, so the
/// limiter and the executor never look at client-specific error types.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The call succeeded. `used_tokens` is the usage the remote reported, if any.
    Success { payload: T, used_tokens: Option<u64> },
    /// The remote signalled throttling (HTTP 429 or an equivalent error).
    RateLimited { retry_after: Option<Duration> },
    /// A retryable server or network condition.
    TransientFailure { error: CrateError },
    /// A non-retryable error, such as a malformed request.
    FatalFailure { error: CrateError },
}

impl<T> Outcome<T> {
    pub fn success(payload: T) -> Self {
        Outcome::Success {
            payload,
            used_tokens: None,
        }
    }

    pub fn transient(error: impl Into<CrateError>) -> Self {
        Outcome::TransientFailure {
            error: error.into(),
        }
    }

    pub fn fatal(error: impl Into<CrateError>) -> Self {
        Outcome::FatalFailure {
            error: error.into(),
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::RateLimited { .. } => "rate_limited",
            Outcome::TransientFailure { .. } => "transient_failure",
            Outcome::FatalFailure { .. } => "fatal_failure",
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success {
                payload,
                used_tokens,
            } => Outcome::Success {
                payload: f(payload),
                used_tokens,
            },
            Outcome::RateLimited { retry_after } => Outcome::RateLimited { retry_after },
            Outcome::TransientFailure { error } => Outcome::TransientFailure { error },
            Outcome::FatalFailure { error } => Outcome::FatalFailure { error },
        }
    }
}

/// What the remote call is told about the attempt it is serving.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptContext {
    /// 1-based attempt number.
    pub attempt: usize,
    pub max_attempts: usize,
    /// Time this attempt spent waiting for rate limiter capacity.
    pub waited: Duration,
}

impl AttemptContext {
    pub const fn is_last(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

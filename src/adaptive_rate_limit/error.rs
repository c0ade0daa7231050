use std::time::Duration;

use snafu::Snafu;

use crate::Error as CrateError;

/// Everything that can go wrong between a caller and the remote.
///
/// Only `RetriesExhausted`, `RemoteFatalFailure` and `PreconditionViolation` are
/// ever returned by [`BackoffExecutor::execute`]; the other kinds describe
/// individual attempts and surface as the `source` of `RetriesExhausted`.
///
/// [`BackoffExecutor::execute`]: super::BackoffExecutor::execute
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RateLimitError {
    /// Invalid input to `acquire` or `execute`. Never retried.
    #[snafu(display("Precondition violated: {details}"))]
    PreconditionViolation { details: String },

    #[snafu(display("Invalid rate limit settings: {details}"))]
    InvalidSettings { details: String },

    /// No capacity could be obtained for the endpoint within the allowed wait.
    #[snafu(display("No capacity for endpoint `{endpoint}` after waiting {waited:?}"))]
    AdmissionTimeout { endpoint: String, waited: Duration },

    /// The remote explicitly asked the caller to slow down.
    #[snafu(display("Remote rate limited the request (retry after: {retry_after:?})"))]
    RemoteRateLimited { retry_after: Option<Duration> },

    #[snafu(display("Transient remote failure: {source}"))]
    RemoteTransientFailure { source: CrateError },

    #[snafu(display("Fatal remote failure: {source}"))]
    RemoteFatalFailure { source: CrateError },

    /// Every attempt was used up; `source` is the error of the last one.
    #[snafu(display("Retries exhausted after {attempts} attempt(s); last error: {source}"))]
    RetriesExhausted {
        attempts: usize,
        source: Box<RateLimitError>,
    },
}

impl RateLimitError {
    pub const fn is_retries_exhausted(&self) -> bool {
        matches!(self, RateLimitError::RetriesExhausted { .. })
    }

    pub const fn is_fatal(&self) -> bool {
        matches!(self, RateLimitError::RemoteFatalFailure { .. })
    }

    /// The error of the final attempt when retries ran out, `self` otherwise.
    pub fn last_error(&self) -> &RateLimitError {
        match self {
            RateLimitError::RetriesExhausted { source, .. } => source,
            other => other,
        }
    }
}

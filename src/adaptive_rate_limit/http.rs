use snafu::Snafu;

use crate::Error as CrateError;

/// Errors at the HTTP boundary, carried inside the failure variants of
/// [`Outcome`](super::Outcome).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    /// Network-level failure such as a refused connection or a DNS error.
    #[snafu(display("HTTP transport error: {}", source))]
    Transport { source: CrateError },

    #[snafu(display("Invalid HTTP request: {}", details))]
    InvalidRequest { details: String },

    /// The remote answered with a non-success status.
    #[snafu(display("HTTP error response (status {}): {}", status, body))]
    ServerError { status: u16, body: String },

    #[snafu(display("HTTP request timed out"))]
    Timeout,

    /// A success response whose body could not be decoded.
    #[snafu(display("Failed to decode response body: {}", source))]
    DecodeBody { source: CrateError },

    #[snafu(display("Generic HTTP client error: {}", source))]
    ClientError { source: CrateError },
}

impl HttpError {
    /// Whether another attempt could succeed without changing the request.
    pub const fn is_retriable(&self) -> bool {
        match self {
            HttpError::Transport { .. } | HttpError::Timeout => true,
            HttpError::ServerError { status, .. } => is_retriable_status(*status),
            HttpError::InvalidRequest { .. }
            | HttpError::DecodeBody { .. }
            | HttpError::ClientError { .. } => false,
        }
    }
}

/// 408, 409 and 5xx; 429 is handled separately as throttling.
pub const fn is_retriable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 500..=599)
}

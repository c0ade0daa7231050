//! Turns `reqwest` results into [`Outcome`]s.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use adaptive_rate_limiter::adaptive_rate_limit::{
//! #     AdaptiveRateLimiter, BackoffExecutor, BackoffSettings, RateLimitSettings,
//! #     reqwest_integration,
//! # };
//! # async fn run() -> Result<(), adaptive_rate_limiter::Error> {
//! let limiter = Arc::new(AdaptiveRateLimiter::new(RateLimitSettings::default())?);
//! let executor = BackoffExecutor::new(limiter, BackoffSettings::default());
//! let client = reqwest::Client::new();
//!
//! let completion = executor
//!     .execute("chat/completions", 800, |_| {
//!         reqwest_integration::send(
//!             client
//!                 .post("https://api.openai.com/v1/chat/completions")
//!                 .json(&serde_json::json!({ "model": "gpt-4o-mini", "messages": [] })),
//!         )
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use http::{HeaderMap, StatusCode, header::RETRY_AFTER};
use serde_json::Value;

use super::{Outcome, http::HttpError, http::is_retriable_status};

/// Sends the request and classifies whatever comes back.
pub async fn send(request: reqwest::RequestBuilder) -> Outcome<Value> {
    match request.send().await {
        Ok(response) => classify_response(response).await,
        Err(error) => classify_error(error),
    }
}

/// Classifies a response by status; success bodies are decoded as JSON.
///
/// Token usage is read from `usage.total_tokens` (OpenAI style) or
/// `usageMetadata.totalTokenCount` (Gemini style) when present.
pub async fn classify_response(response: reqwest::Response) -> Outcome<Value> {
    let status = response.status();

    if status.is_success() {
        return match response.json::<Value>().await {
            Ok(payload) => {
                let used_tokens = used_tokens(&payload);
                Outcome::Success {
                    payload,
                    used_tokens,
                }
            }
            Err(error) => {
                error!(message = "Undecodable success response.", %status, %error);
                Outcome::fatal(HttpError::DecodeBody {
                    source: Box::new(error),
                })
            }
        };
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = retry_after(response.headers());
        warn!(message = "Rate limited by remote.", %status, ?retry_after);
        return Outcome::RateLimited { retry_after };
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Could not read error body".to_string());
    let error = HttpError::ServerError {
        status: status.as_u16(),
        body,
    };

    if is_retriable_status(status.as_u16()) {
        warn!(message = "Server error.", %status, %error);
        Outcome::transient(error)
    } else {
        error!(message = "Client error.", %status, %error);
        Outcome::fatal(error)
    }
}

/// Classifies a failure that produced no response at all.
pub fn classify_error<T>(error: reqwest::Error) -> Outcome<T> {
    if error.is_timeout() {
        warn!(message = "Request timed out.", %error);
        Outcome::transient(HttpError::Timeout)
    } else if error.is_connect() {
        warn!(message = "Connection error.", %error);
        Outcome::transient(HttpError::Transport {
            source: Box::new(error),
        })
    } else if error.is_builder() {
        error!(message = "Invalid request.", %error);
        Outcome::fatal(HttpError::InvalidRequest {
            details: error.to_string(),
        })
    } else if error.is_request() {
        warn!(message = "Request failed in transit.", %error);
        Outcome::transient(HttpError::Transport {
            source: Box::new(error),
        })
    } else {
        error!(message = "Other reqwest error.", %error);
        Outcome::fatal(HttpError::ClientError {
            source: Box::new(error),
        })
    }
}

/// `Retry-After` in delay-seconds form; HTTP dates are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<f64>().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

fn used_tokens(payload: &Value) -> Option<u64> {
    payload
        .pointer("/usage/total_tokens")
        .or_else(|| payload.pointer("/usageMetadata/totalTokenCount"))
        .and_then(Value::as_u64)
}

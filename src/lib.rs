//! Adaptive client-side rate limiting for request- and token-limited inference APIs.
//!
//! Every logical endpoint (e.g. `"chat/completions"`) gets a pair of continuously
//! refilling token buckets, one counting requests and one counting model tokens.
//! Callers acquire capacity before talking to the remote and report the outcome
//! afterwards; the limiter uses that feedback to move each endpoint's steady-state
//! rate up or down.
//!
//! # Algorithm Overview
//!
//! 1. **Additive Increase**: when a window's success rate reaches the target, the
//!    requests-per-minute and tokens-per-minute targets grow by a fixed step
//! 2. **Multiplicative Decrease**: a throttle signal (or a poor success rate)
//!    multiplies both targets by the decrease factor (default: 0.5)
//!
//! A throttle reported by the remote is applied immediately; every other change
//! waits for the next adjustment boundary.
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//! use adaptive_rate_limiter::adaptive_rate_limit::{
//!     AdaptiveRateLimiter, BackoffExecutor, BackoffSettings, Outcome, RateLimitSettings,
//! };
//!
//! # async fn run() -> Result<(), adaptive_rate_limiter::adaptive_rate_limit::RateLimitError> {
//! let limiter = Arc::new(AdaptiveRateLimiter::new(RateLimitSettings::default())?);
//! let executor = BackoffExecutor::new(limiter, BackoffSettings::default());
//!
//! let answer = executor
//!     .execute("chat/completions", 512, |_attempt| async {
//!         Outcome::Success { payload: "hello", used_tokens: Some(480) }
//!     })
//!     .await?;
//! # let _ = answer;
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//! - Each endpoint's buckets and statistics sit behind their own mutex; traffic on
//!   one endpoint never waits on another
//! - Waiting for capacity and backing off between retries never hold a lock
//! - Waiters are not served in FIFO order: whoever re-checks first after a refill wins
//!
//! # Metrics
//! Emits events through the [`adaptive_rate_limit::MetricsSink`] trait
pub mod adaptive_rate_limit;
#[cfg(test)]
pub mod test_utils;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

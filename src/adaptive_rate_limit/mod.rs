//! Limit the request and token throughput sent to each remote endpoint.

mod bucket;
mod controller;
mod error;
mod limiter;
mod outcome;
mod stats;

pub mod http;
pub mod internal_event;
pub mod layer;
pub mod reqwest_integration;
pub mod retries;
pub mod service;

use std::time::Duration;

use bon::Builder;
use serde::Deserialize;

pub use bucket::TokenBucket;
pub use controller::RateRegime;
pub use error::RateLimitError;
pub use internal_event::{MetricsSink, NoopSink, RateLimitEvent, RejectReason};
pub use layer::AdaptiveRateLimitLayer;
pub use limiter::{Acquisition, AdaptiveRateLimiter};
pub use outcome::{AttemptContext, Outcome};
pub use retries::{BackoffExecutor, BackoffSettings, JitterMode};
pub use service::{AdaptiveRateLimit, RateLimitedRequest};
pub use stats::{EndpointStats, EndpointStatus};

fn instant_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

/// Configuration of the per-endpoint limits and of the feedback loop that tunes them.
///
/// Rates are expressed per minute, the unit inference providers publish their limits
/// in. Each endpoint starts at the initial rates and is then moved inside
/// `[min, max]` by the observed outcomes.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `initial_requests_per_minute` | 60 | Starting RPM target of a newly seen endpoint |
/// | `initial_tokens_per_minute` | 40 000 | Starting TPM target of a newly seen endpoint |
/// | `min_requests_per_minute` / `max_requests_per_minute` | 1 / 600 | RPM bounds |
/// | `min_tokens_per_minute` / `max_tokens_per_minute` | 1 000 / 1 000 000 | TPM bounds |
/// | `burst_multiplier` | 1.5 | Bucket size as a multiple of the per-minute rate |
/// | `success_rate_target` | 0.95 | Window success rate at or above which rates grow |
/// | `degraded_success_rate` | 0.5 | Window success rate below which rates shrink |
/// | `requests_increase_step` | 5 | RPM added on a healthy window |
/// | `tokens_increase_step` | 2 000 | TPM added on a healthy window |
/// | `decrease_factor` | 0.5 | Multiplier applied on throttling or a degraded window |
/// | `adjustment_interval_secs` | 60 | Length of an observation window |
/// | `min_samples` | 10 | Observations needed before a window is judged |
/// | `max_window_observations` | 100 | Observations that close a window early |
///
/// # Example
///
/// ```rust
/// use adaptive_rate_limiter::adaptive_rate_limit::RateLimitSettings;
///
/// let settings = RateLimitSettings::builder()
///     .initial_requests_per_minute(120.0)
///     .max_requests_per_minute(500.0)
///     .decrease_factor(0.7)
///     .build();
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, Builder, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    /// The requests-per-minute target an endpoint starts with.
    #[builder(default = default_initial_requests_per_minute())]
    pub initial_requests_per_minute: f64,

    /// The tokens-per-minute target an endpoint starts with.
    #[builder(default = default_initial_tokens_per_minute())]
    pub initial_tokens_per_minute: f64,

    #[builder(default = default_min_requests_per_minute())]
    pub min_requests_per_minute: f64,

    #[builder(default = default_max_requests_per_minute())]
    pub max_requests_per_minute: f64,

    #[builder(default = default_min_tokens_per_minute())]
    pub min_tokens_per_minute: f64,

    #[builder(default = default_max_tokens_per_minute())]
    pub max_tokens_per_minute: f64,

    /// Bucket capacity as a multiple of the per-minute rate.
    ///
    /// With 60 RPM and a multiplier of 1.5 the request bucket holds at most 90
    /// requests, all of which may be spent at once after an idle period.
    #[builder(default = default_burst_multiplier())]
    pub burst_multiplier: f64,

    /// Success rate at or above which a window counts as healthy and rates grow.
    #[builder(default = default_success_rate_target())]
    pub success_rate_target: f64,

    /// Success rate below which a window counts as degraded and rates shrink.
    #[builder(default = default_degraded_success_rate())]
    pub degraded_success_rate: f64,

    /// Requests per minute added after a healthy window.
    #[builder(default = default_requests_increase_step())]
    pub requests_increase_step: f64,

    /// Tokens per minute added after a healthy window.
    #[builder(default = default_tokens_increase_step())]
    pub tokens_increase_step: f64,

    /// Multiplicative decrease applied on throttling or after a degraded window.
    ///
    /// **Range**: 0 < decrease_factor < 1
    #[builder(default = default_decrease_factor())]
    pub decrease_factor: f64,

    /// Length of an observation window in seconds.
    #[builder(default = default_adjustment_interval_secs())]
    pub adjustment_interval_secs: u64,

    /// Minimum number of observations a window needs before it is judged.
    ///
    /// Keeps a single early failure from halving the rate of a fresh endpoint.
    #[builder(default = default_min_samples())]
    pub min_samples: u64,

    /// Number of observations that closes a window before the interval elapses.
    #[builder(default = default_max_window_observations())]
    pub max_window_observations: u64,
}

const fn default_initial_requests_per_minute() -> f64 {
    60.0
}

const fn default_initial_tokens_per_minute() -> f64 {
    40_000.0
}

const fn default_min_requests_per_minute() -> f64 {
    1.0
}

const fn default_max_requests_per_minute() -> f64 {
    600.0
}

const fn default_min_tokens_per_minute() -> f64 {
    1_000.0
}

const fn default_max_tokens_per_minute() -> f64 {
    1_000_000.0
}

const fn default_burst_multiplier() -> f64 {
    1.5
}

const fn default_success_rate_target() -> f64 {
    0.95
}

const fn default_degraded_success_rate() -> f64 {
    0.5
}

const fn default_requests_increase_step() -> f64 {
    5.0
}

const fn default_tokens_increase_step() -> f64 {
    2_000.0
}

/// Returns the default decrease factor (0.5).
///
/// Halving converges quickly when the provider keeps answering 429.
const fn default_decrease_factor() -> f64 {
    0.5
}

const fn default_adjustment_interval_secs() -> u64 {
    60
}

const fn default_min_samples() -> u64 {
    10
}

const fn default_max_window_observations() -> u64 {
    100
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            initial_requests_per_minute: default_initial_requests_per_minute(),
            initial_tokens_per_minute: default_initial_tokens_per_minute(),
            min_requests_per_minute: default_min_requests_per_minute(),
            max_requests_per_minute: default_max_requests_per_minute(),
            min_tokens_per_minute: default_min_tokens_per_minute(),
            max_tokens_per_minute: default_max_tokens_per_minute(),
            burst_multiplier: default_burst_multiplier(),
            success_rate_target: default_success_rate_target(),
            degraded_success_rate: default_degraded_success_rate(),
            requests_increase_step: default_requests_increase_step(),
            tokens_increase_step: default_tokens_increase_step(),
            decrease_factor: default_decrease_factor(),
            adjustment_interval_secs: default_adjustment_interval_secs(),
            min_samples: default_min_samples(),
            max_window_observations: default_max_window_observations(),
        }
    }
}

impl RateLimitSettings {
    pub const fn adjustment_interval(&self) -> Duration {
        Duration::from_secs(self.adjustment_interval_secs)
    }

    /// Checks that the bounds and ratios describe a usable feedback loop.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        let positive = [
            ("initial_requests_per_minute", self.initial_requests_per_minute),
            ("initial_tokens_per_minute", self.initial_tokens_per_minute),
            ("min_requests_per_minute", self.min_requests_per_minute),
            ("max_requests_per_minute", self.max_requests_per_minute),
            ("min_tokens_per_minute", self.min_tokens_per_minute),
            ("max_tokens_per_minute", self.max_tokens_per_minute),
            ("burst_multiplier", self.burst_multiplier),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return error::InvalidSettingsSnafu {
                    details: format!("`{name}` must be positive and finite, got {value}"),
                }
                .fail();
            }
        }

        if self.min_requests_per_minute > self.max_requests_per_minute {
            return error::InvalidSettingsSnafu {
                details: format!(
                    "`min_requests_per_minute` ({}) exceeds `max_requests_per_minute` ({})",
                    self.min_requests_per_minute, self.max_requests_per_minute
                ),
            }
            .fail();
        }
        if self.min_tokens_per_minute > self.max_tokens_per_minute {
            return error::InvalidSettingsSnafu {
                details: format!(
                    "`min_tokens_per_minute` ({}) exceeds `max_tokens_per_minute` ({})",
                    self.min_tokens_per_minute, self.max_tokens_per_minute
                ),
            }
            .fail();
        }

        let ratios = [
            ("success_rate_target", self.success_rate_target),
            ("degraded_success_rate", self.degraded_success_rate),
            ("decrease_factor", self.decrease_factor),
        ];
        for (name, value) in ratios {
            if !(value > 0.0 && value <= 1.0) {
                return error::InvalidSettingsSnafu {
                    details: format!("`{name}` must lie in (0, 1], got {value}"),
                }
                .fail();
            }
        }
        if self.degraded_success_rate > self.success_rate_target {
            return error::InvalidSettingsSnafu {
                details: "`degraded_success_rate` exceeds `success_rate_target`".to_string(),
            }
            .fail();
        }

        if !(self.requests_increase_step >= 0.0 && self.tokens_increase_step >= 0.0) {
            return error::InvalidSettingsSnafu {
                details: "increase steps must not be negative".to_string(),
            }
            .fail();
        }

        if self.min_samples == 0 {
            return error::InvalidSettingsSnafu {
                details: "`min_samples` must be at least 1".to_string(),
            }
            .fail();
        }

        Ok(())
    }

    /// Request bucket capacity for a given requests-per-minute target.
    pub fn request_burst(&self, requests_per_minute: f64) -> f64 {
        requests_per_minute * self.burst_multiplier
    }

    /// Token bucket capacity for a given tokens-per-minute target.
    pub fn token_burst(&self, tokens_per_minute: f64) -> f64 {
        tokens_per_minute * self.burst_multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_default() {
        assert_eq!(RateLimitSettings::builder().build(), RateLimitSettings::default());
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let settings = RateLimitSettings::builder()
            .min_requests_per_minute(100.0)
            .max_requests_per_minute(10.0)
            .build();
        let error = settings.validate().unwrap_err();
        assert!(matches!(error, RateLimitError::InvalidSettings { .. }));
    }

    #[test]
    fn validate_rejects_decrease_factor_out_of_range() {
        let settings = RateLimitSettings::builder().decrease_factor(1.5).build();
        assert!(settings.validate().is_err());

        let settings = RateLimitSettings::builder().decrease_factor(0.0).build();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn deserializes_partial_settings() {
        let settings: RateLimitSettings = serde_json::from_str(
            r#"{ "initial_requests_per_minute": 30.0, "adjustment_interval_secs": 10 }"#,
        )
        .unwrap();

        assert_eq!(settings.initial_requests_per_minute, 30.0);
        assert_eq!(settings.adjustment_interval(), Duration::from_secs(10));
        assert_eq!(settings.burst_multiplier, 1.5);
    }

    #[test]
    fn deserialize_rejects_unknown_fields() {
        let result = serde_json::from_str::<RateLimitSettings>(r#"{ "initial_rpm": 30.0 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn burst_scales_with_rate() {
        let settings = RateLimitSettings::default();
        assert_eq!(settings.request_burst(60.0), 90.0);
        assert_eq!(settings.token_burst(40_000.0), 60_000.0);
    }
}

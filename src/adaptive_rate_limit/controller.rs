use tokio::time::Instant;

use super::{RateLimitSettings, stats::EndpointStats};

/// How an observation window is judged at an adjustment boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateRegime {
    /// Success rate reached the target: grow additively.
    Steady,
    /// Throttling was seen or the success rate collapsed: shrink multiplicatively.
    Degraded,
    /// In between: keep the current rates.
    Neutral,
}

impl RateRegime {
    pub fn classify(stats: &EndpointStats, settings: &RateLimitSettings) -> Self {
        if stats.throttle_count() > 0 {
            return RateRegime::Degraded;
        }
        match stats.success_rate() {
            Some(rate) if rate >= settings.success_rate_target => RateRegime::Steady,
            Some(rate) if rate < settings.degraded_success_rate => RateRegime::Degraded,
            _ => RateRegime::Neutral,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            RateRegime::Steady => "steady",
            RateRegime::Degraded => "degraded",
            RateRegime::Neutral => "neutral",
        }
    }
}

/// The steady-state targets bucket refill rates are derived from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct RateTargets {
    pub(crate) requests_per_minute: f64,
    pub(crate) tokens_per_minute: f64,
}

impl RateTargets {
    pub(crate) fn initial(settings: &RateLimitSettings) -> Self {
        Self {
            requests_per_minute: settings.initial_requests_per_minute,
            tokens_per_minute: settings.initial_tokens_per_minute,
        }
        .clamped(settings)
    }

    pub(crate) fn of(stats: &EndpointStats) -> Self {
        Self {
            requests_per_minute: stats.current_requests_per_minute(),
            tokens_per_minute: stats.current_tokens_per_minute(),
        }
    }

    fn clamped(self, settings: &RateLimitSettings) -> Self {
        Self {
            requests_per_minute: self
                .requests_per_minute
                .clamp(settings.min_requests_per_minute, settings.max_requests_per_minute),
            tokens_per_minute: self
                .tokens_per_minute
                .clamp(settings.min_tokens_per_minute, settings.max_tokens_per_minute),
        }
    }

    pub(crate) fn increased(self, settings: &RateLimitSettings) -> Self {
        Self {
            requests_per_minute: self.requests_per_minute + settings.requests_increase_step,
            tokens_per_minute: self.tokens_per_minute + settings.tokens_increase_step,
        }
        .clamped(settings)
    }

    pub(crate) fn decreased(self, settings: &RateLimitSettings) -> Self {
        Self {
            requests_per_minute: self.requests_per_minute * settings.decrease_factor,
            tokens_per_minute: self.tokens_per_minute * settings.decrease_factor,
        }
        .clamped(settings)
    }

    pub(crate) fn after(self, regime: RateRegime, settings: &RateLimitSettings) -> Self {
        match regime {
            RateRegime::Steady => self.increased(settings),
            RateRegime::Degraded => self.decreased(settings),
            RateRegime::Neutral => self,
        }
    }

    pub(crate) fn request_refill_per_second(&self) -> f64 {
        self.requests_per_minute / 60.0
    }

    pub(crate) fn token_refill_per_second(&self) -> f64 {
        self.tokens_per_minute / 60.0
    }
}

/// Whether the current window of `stats` has reached an adjustment boundary.
///
/// A window closes once the interval has elapsed or enough observations piled up,
/// and never before it holds `min_samples` observations.
pub(crate) fn window_closed(stats: &EndpointStats, settings: &RateLimitSettings, now: Instant) -> bool {
    let samples = stats.window_samples();
    if samples < settings.min_samples {
        return false;
    }
    let elapsed = now.saturating_duration_since(stats.last_adjustment());
    elapsed >= settings.adjustment_interval() || samples >= settings.max_window_observations
}

use std::{future::Future, sync::Arc, time::Duration};

use bon::Builder;
use serde::Deserialize;
use snafu::ensure;
use tokio::time::{Instant, sleep};

use super::{
    AdaptiveRateLimiter, RejectReason,
    error::{PreconditionViolationSnafu, RateLimitError},
    instant_now,
    internal_event::RateLimitEvent,
    outcome::{AttemptContext, Outcome},
};

/// The jitter mode to use for retry backoff behavior.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// No jitter.
    None,

    /// Proportional jitter.
    ///
    /// A random extra delay of up to half the computed delay is added, so that
    /// callers throttled at the same moment do not come back at the same moment.
    #[default]
    Proportional,
}

/// Retry policy of a [`BackoffExecutor`].
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `max_attempts` | 5 | Calls to the remote (and acquisitions) before giving up |
/// | `base_delay_ms` | 500 | First backoff delay; doubles on every throttled attempt |
/// | `max_delay_secs` | 60 | Upper bound of a single backoff delay |
/// | `acquire_max_wait_secs` | 30 | How long one acquisition may wait for capacity |
/// | `jitter_mode` | `proportional` | See [`JitterMode`] |
/// | `deadline_secs` | none | Optional overall budget across all attempts |
#[derive(Clone, Copy, Debug, Builder, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffSettings {
    #[builder(default = default_max_attempts())]
    pub max_attempts: usize,

    #[builder(default = default_base_delay_ms())]
    pub base_delay_ms: u64,

    #[builder(default = default_max_delay_secs())]
    pub max_delay_secs: u64,

    #[builder(default = default_acquire_max_wait_secs())]
    pub acquire_max_wait_secs: u64,

    #[builder(default)]
    pub jitter_mode: JitterMode,

    /// No new attempt is scheduled once its backoff would end past this budget.
    pub deadline_secs: Option<u64>,
}

const fn default_max_attempts() -> usize {
    5
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_secs() -> u64 {
    60
}

const fn default_acquire_max_wait_secs() -> u64 {
    30
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            acquire_max_wait_secs: default_acquire_max_wait_secs(),
            jitter_mode: JitterMode::default(),
            deadline_secs: None,
        }
    }
}

impl BackoffSettings {
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub const fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub const fn acquire_max_wait(&self) -> Duration {
        Duration::from_secs(self.acquire_max_wait_secs)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    fn jitter(&self, delay: Duration) -> Duration {
        match self.jitter_mode {
            JitterMode::None => delay,
            JitterMode::Proportional => {
                let extra = (delay / 2).mul_f64(rand::random::<f64>());
                delay.saturating_add(extra)
            }
        }
    }
}

/// A retry schedule driven by exponential back-off.
///
/// The delay before retry `n` is `base * 2^(n - 1)`, never more than `max_delay`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub const fn new(base: Duration, max_delay: Duration) -> Self {
        Self { base, max_delay }
    }

    /// Delay after the given 1-based attempt failed.
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        self.base.saturating_mul(1 << exponent).min(self.max_delay)
    }
}

/// What a single attempt leads to.
enum Step<T> {
    Done(T),
    Retry {
        error: RateLimitError,
        delay: Duration,
    },
}

/// Runs remote calls behind an [`AdaptiveRateLimiter`], retrying throttled and
/// transient failures with backoff and reporting every outcome to the limiter.
///
/// The executor only holds a shared handle to the limiter; cloning it is cheap.
/// No lock is held while it sleeps.
#[derive(Clone, Debug)]
pub struct BackoffExecutor {
    limiter: Arc<AdaptiveRateLimiter>,
    settings: BackoffSettings,
}

impl BackoffExecutor {
    pub fn new(limiter: Arc<AdaptiveRateLimiter>, settings: BackoffSettings) -> Self {
        Self { limiter, settings }
    }

    pub fn limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.limiter
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    /// Calls `remote_call` until it succeeds, fails fatally, or the attempts run out.
    ///
    /// Capacity for one request and `estimated_tokens` tokens is acquired before
    /// every attempt. The caller sees the payload or one terminal error:
    /// [`RateLimitError::RetriesExhausted`] (carrying the last attempt's error),
    /// [`RateLimitError::RemoteFatalFailure`] or
    /// [`RateLimitError::PreconditionViolation`]. The latter is only returned
    /// before the first attempt, for an estimate above the endpoint's
    /// [largest burst](AdaptiveRateLimiter::largest_token_burst); an estimate that
    /// merely exceeds the current, reduced burst is backed off and retried.
    pub async fn execute<T, F, Fut>(
        &self,
        endpoint: &str,
        estimated_tokens: u64,
        remote_call: F,
    ) -> Result<T, RateLimitError>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        self.execute_with(endpoint, estimated_tokens, self.settings, remote_call)
            .await
    }

    /// Same as [`execute`](Self::execute) with a policy for this call only.
    pub async fn execute_with<T, F, Fut>(
        &self,
        endpoint: &str,
        estimated_tokens: u64,
        settings: BackoffSettings,
        mut remote_call: F,
    ) -> Result<T, RateLimitError>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        ensure!(
            settings.max_attempts > 0,
            PreconditionViolationSnafu {
                details: "max_attempts must be at least 1",
            }
        );

        let largest_burst = self.limiter.largest_token_burst(endpoint)?;
        ensure!(
            estimated_tokens as f64 <= largest_burst,
            PreconditionViolationSnafu {
                details: format!(
                    "estimated cost of {estimated_tokens} tokens exceeds the largest burst of `{endpoint}` ({largest_burst})"
                ),
            }
        );

        let started = instant_now();
        let mut attempt = 1;
        loop {
            let (error, delay) = match self
                .attempt(endpoint, estimated_tokens, &settings, attempt, &mut remote_call)
                .await?
            {
                Step::Done(payload) => return Ok(payload),
                Step::Retry { error, delay } => (error, delay),
            };

            if attempt >= settings.max_attempts {
                error!(
                    message = "Retries exhausted; dropping the request.",
                    endpoint,
                    attempts = attempt,
                    %error,
                );
                return Err(RateLimitError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            if past_deadline(&settings, started, delay) {
                error!(
                    message = "Deadline reached; dropping the request.",
                    endpoint,
                    attempts = attempt,
                    %error,
                );
                return Err(RateLimitError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            debug!(
                message = "Retrying request.",
                endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
            );
            self.limiter.emit(RateLimitEvent::RetryScheduled {
                endpoint,
                attempt,
                delay,
            });
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        endpoint: &str,
        estimated_tokens: u64,
        settings: &BackoffSettings,
        attempt: usize,
        remote_call: &mut F,
    ) -> Result<Step<T>, RateLimitError>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let backoff = ExponentialBackoff::new(settings.base_delay(), settings.max_delay());
        let throttled_delay = |hint: Option<Duration>| {
            let delay = settings.jitter(backoff.delay(attempt));
            hint.map_or(delay, |hint| delay.max(hint))
                .min(settings.max_delay())
        };

        let acquisition = self
            .limiter
            .acquire(endpoint, estimated_tokens, settings.acquire_max_wait())
            .await?;

        if !acquisition.acquired {
            if acquisition.rejection == Some(RejectReason::ExceedsBurst) {
                // The burst shrank below the estimate after a decrease. Another
                // decrease would only push it further away, so just wait.
                warn!(
                    message = "Estimate exceeds the current burst; backing off.",
                    endpoint,
                    attempt,
                    estimated_tokens,
                );
            } else {
                self.limiter.record_throttled(endpoint);
                warn!(
                    message = "No capacity within the allowed wait; backing off.",
                    endpoint,
                    attempt,
                    waited_ms = acquisition.waited.as_millis() as u64,
                );
            }
            return Ok(Step::Retry {
                error: RateLimitError::AdmissionTimeout {
                    endpoint: endpoint.to_owned(),
                    waited: acquisition.waited,
                },
                delay: throttled_delay(None),
            });
        }

        let context = AttemptContext {
            attempt,
            max_attempts: settings.max_attempts,
            waited: acquisition.waited,
        };

        match remote_call(context).await {
            Outcome::Success {
                payload,
                used_tokens,
            } => {
                self.limiter.record_success(endpoint, used_tokens);
                Ok(Step::Done(payload))
            }
            Outcome::RateLimited { retry_after } => {
                self.limiter.record_throttled(endpoint);
                warn!(
                    message = "Remote rate limited the request.",
                    endpoint,
                    attempt,
                    retry_after_ms = retry_after.map(|hint| hint.as_millis() as u64),
                );
                Ok(Step::Retry {
                    error: RateLimitError::RemoteRateLimited { retry_after },
                    delay: throttled_delay(retry_after),
                })
            }
            Outcome::TransientFailure { error } => {
                self.limiter.record_failure(endpoint);
                warn!(message = "Retrying after transient failure.", endpoint, attempt, %error);
                Ok(Step::Retry {
                    error: RateLimitError::RemoteTransientFailure { source: error },
                    delay: settings.jitter(settings.base_delay()).min(settings.max_delay()),
                })
            }
            Outcome::FatalFailure { error } => {
                self.limiter.record_failure(endpoint);
                error!(message = "Non-retriable failure; dropping the request.", endpoint, attempt, %error);
                Err(RateLimitError::RemoteFatalFailure { source: error })
            }
        }
    }
}

fn past_deadline(settings: &BackoffSettings, started: Instant, delay: Duration) -> bool {
    settings
        .deadline()
        .is_some_and(|deadline| started.elapsed().saturating_add(delay) > deadline)
}

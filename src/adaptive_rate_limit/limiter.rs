use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use snafu::ensure;
use tokio::time::{Instant, sleep};

use super::{
    RateLimitSettings, TokenBucket,
    controller::{RateRegime, RateTargets, window_closed},
    error::{PreconditionViolationSnafu, RateLimitError},
    instant_now,
    internal_event::{self, MetricsSink, NoopSink, RateLimitEvent, RejectReason},
    stats::{EndpointStats, EndpointStatus},
};

/// Number of wait-then-consume rounds an acquisition may go through. The wait
/// computed before sleeping can be stale by the time the caller wakes up, so
/// one more round is allowed; after that the caller is turned away instead of
/// spinning.
const ADMISSION_ROUNDS: usize = 2;

/// Result of [`AdaptiveRateLimiter::acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Acquisition {
    pub acquired: bool,
    /// Time spent waiting for capacity before the decision.
    pub waited: Duration,
    /// Set when `acquired` is false.
    pub rejection: Option<RejectReason>,
}

impl Acquisition {
    const fn granted(waited: Duration) -> Self {
        Self {
            acquired: true,
            waited,
            rejection: None,
        }
    }

    const fn rejected(reason: RejectReason, waited: Duration) -> Self {
        Self {
            acquired: false,
            waited,
            rejection: Some(reason),
        }
    }
}

/// The `(request bucket, token bucket, stats)` triple of one endpoint.
#[derive(Debug)]
struct EndpointState {
    settings: RateLimitSettings,
    request_bucket: TokenBucket,
    token_bucket: TokenBucket,
    stats: EndpointStats,
}

impl EndpointState {
    fn new(name: &str, settings: RateLimitSettings, now: Instant) -> Self {
        let targets = RateTargets::initial(&settings);
        Self {
            settings,
            request_bucket: TokenBucket::starting_at(
                targets.request_refill_per_second(),
                settings.request_burst(targets.requests_per_minute),
                now,
            ),
            token_bucket: TokenBucket::starting_at(
                targets.token_refill_per_second(),
                settings.token_burst(targets.tokens_per_minute),
                now,
            ),
            stats: EndpointStats::new(name, targets.requests_per_minute, targets.tokens_per_minute, now),
        }
    }

    /// Longest wait across both dimensions, `None` if either can never be met.
    fn wait_for(&self, tokens: f64, now: Instant) -> Option<Duration> {
        let requests = self.request_bucket.time_until_available_at(1.0, now)?;
        let tokens = self.token_bucket.time_until_available_at(tokens, now)?;
        Some(requests.max(tokens))
    }

    /// Takes one request and `tokens` tokens, or nothing at all.
    fn try_admit(&mut self, tokens: f64, now: Instant) -> bool {
        if !(self.request_bucket.has_capacity_at(1.0, now) && self.token_bucket.has_capacity_at(tokens, now)) {
            return false;
        }
        self.request_bucket.try_consume_at(1.0, now) && self.token_bucket.try_consume_at(tokens, now)
    }

    fn apply(&mut self, targets: RateTargets, now: Instant) {
        self.request_bucket.set_refill_rate_at(
            targets.request_refill_per_second(),
            self.settings.request_burst(targets.requests_per_minute),
            now,
        );
        self.token_bucket.set_refill_rate_at(
            targets.token_refill_per_second(),
            self.settings.token_burst(targets.tokens_per_minute),
            now,
        );
        self.stats
            .start_window(targets.requests_per_minute, targets.tokens_per_minute, now);
    }

    /// Judges the window if it reached a boundary and applies the resulting rates.
    fn maybe_adjust(&mut self, now: Instant) -> Option<(RateRegime, RateTargets)> {
        if !window_closed(&self.stats, &self.settings, now) {
            return None;
        }
        let regime = RateRegime::classify(&self.stats, &self.settings);
        let targets = RateTargets::of(&self.stats).after(regime, &self.settings);
        self.apply(targets, now);
        Some((regime, targets))
    }

    /// Switches to new settings and their initial rates, keeping the current
    /// capacity (clamped to the new burst) and the lifetime totals.
    fn reconfigure(&mut self, settings: RateLimitSettings, now: Instant) -> RateTargets {
        self.settings = settings;
        let targets = RateTargets::initial(&settings);
        self.apply(targets, now);
        targets
    }

    fn capacities(&self, now: Instant) -> (f64, f64) {
        (
            self.request_bucket.capacity_at(now),
            self.token_bucket.capacity_at(now),
        )
    }
}

fn lock(state: &Mutex<EndpointState>) -> MutexGuard<'_, EndpointState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-endpoint admission control over requests-per-minute and tokens-per-minute,
/// with rates tuned by success and throttle feedback.
///
/// Construct one instance at startup and share it (usually behind an [`Arc`])
/// with every caller. Each endpoint's state has its own lock, so activity on one
/// endpoint never blocks another. No fairness is attempted between waiters:
/// after a refill, whichever caller re-checks first gets the capacity.
pub struct AdaptiveRateLimiter {
    settings: RateLimitSettings,
    endpoints: RwLock<HashMap<String, Arc<Mutex<EndpointState>>>>,
    sink: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("settings", &self.settings)
            .field("endpoints", &self.endpoint_names())
            .finish_non_exhaustive()
    }
}

impl AdaptiveRateLimiter {
    pub fn new(settings: RateLimitSettings) -> Result<Self, RateLimitError> {
        Self::with_sink(settings, Arc::new(NoopSink))
    }

    pub fn with_sink(settings: RateLimitSettings, sink: Arc<dyn MetricsSink>) -> Result<Self, RateLimitError> {
        settings.validate()?;
        Ok(Self {
            settings,
            endpoints: RwLock::new(HashMap::new()),
            sink,
        })
    }

    /// Settings used for endpoints created on first use.
    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Gives `endpoint` its own settings instead of the defaults.
    ///
    /// A live endpoint is reconfigured in place: it moves to the new initial
    /// rates, keeps its current capacity (clamped to the new burst) and its
    /// statistics, and callers already waiting on it stay on the same buckets.
    pub fn register_endpoint(&self, endpoint: &str, settings: RateLimitSettings) -> Result<(), RateLimitError> {
        ensure!(
            !endpoint.is_empty(),
            PreconditionViolationSnafu {
                details: "endpoint name must not be empty",
            }
        );
        settings.validate()?;

        let now = instant_now();
        let (targets, replaced) = {
            let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
            match endpoints.get(endpoint) {
                Some(state) => (lock(state).reconfigure(settings, now), true),
                None => {
                    let state = EndpointState::new(endpoint, settings, now);
                    let targets = RateTargets::of(&state.stats);
                    endpoints.insert(endpoint.to_owned(), Arc::new(Mutex::new(state)));
                    (targets, false)
                }
            }
        };

        debug!(message = "Registered endpoint.", endpoint, replaced);
        self.emit_rates(endpoint, targets);
        Ok(())
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn endpoint(&self, endpoint: &str) -> Arc<Mutex<EndpointState>> {
        if let Some(state) = self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
        {
            return Arc::clone(state);
        }

        let mut created = None;
        let state = {
            let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
            let state = endpoints.entry(endpoint.to_owned()).or_insert_with(|| {
                let state = EndpointState::new(endpoint, self.settings, instant_now());
                created = Some(RateTargets::of(&state.stats));
                Arc::new(Mutex::new(state))
            });
            Arc::clone(state)
        };

        if let Some(targets) = created {
            debug!(
                message = "Created endpoint buckets with default rates.",
                endpoint,
                requests_per_minute = targets.requests_per_minute,
                tokens_per_minute = targets.tokens_per_minute,
            );
            self.emit_rates(endpoint, targets);
        }
        state
    }

    /// Token bucket size of `endpoint` at its maximum tokens-per-minute rate.
    ///
    /// An estimate above this can never be admitted, whatever the feedback.
    pub fn largest_token_burst(&self, endpoint: &str) -> Result<f64, RateLimitError> {
        ensure!(
            !endpoint.is_empty(),
            PreconditionViolationSnafu {
                details: "endpoint name must not be empty",
            }
        );
        let state = self.endpoint(endpoint);
        let settings = lock(&state).settings;
        Ok(settings.token_burst(settings.max_tokens_per_minute))
    }

    pub(crate) fn emit(&self, event: RateLimitEvent<'_>) {
        internal_event::emit(self.sink.as_ref(), event);
    }

    fn emit_rates(&self, endpoint: &str, targets: RateTargets) {
        self.emit(RateLimitEvent::RateAdjusted {
            endpoint,
            requests_per_minute: targets.requests_per_minute,
            tokens_per_minute: targets.tokens_per_minute,
        });
    }

    fn reject(&self, state: &Mutex<EndpointState>, endpoint: &str, reason: RejectReason, waited: Duration) -> Acquisition {
        lock(state).stats.record_rejected();
        debug!(
            message = "Acquisition rejected.",
            endpoint,
            reason = reason.as_str(),
            waited_ms = waited.as_millis() as u64,
        );
        self.emit(RateLimitEvent::AcquisitionRejected { endpoint, reason });
        Acquisition::rejected(reason, waited)
    }

    /// Waits until one request and `estimated_tokens` tokens are available for
    /// `endpoint`, then takes them.
    ///
    /// Returns `acquired: false` instead of an error when the capacity cannot be
    /// obtained within `max_wait`; nothing is consumed in that case. A request
    /// larger than the token bucket can ever hold is turned away without waiting.
    /// The endpoint is created with the default settings on first use.
    ///
    /// Waiting suspends the task and holds no lock.
    pub async fn acquire(
        &self,
        endpoint: &str,
        estimated_tokens: u64,
        max_wait: Duration,
    ) -> Result<Acquisition, RateLimitError> {
        ensure!(
            !endpoint.is_empty(),
            PreconditionViolationSnafu {
                details: "endpoint name must not be empty",
            }
        );

        let state = self.endpoint(endpoint);
        let tokens = estimated_tokens as f64;
        let started = instant_now();

        for round in 1..=ADMISSION_ROUNDS {
            let now = instant_now();
            let waited = now.saturating_duration_since(started);
            let wait = { lock(&state).wait_for(tokens, now) };

            let Some(wait) = wait else {
                return Ok(self.reject(&state, endpoint, RejectReason::ExceedsBurst, waited));
            };
            if waited.saturating_add(wait) > max_wait {
                return Ok(self.reject(&state, endpoint, RejectReason::WaitTooLong, waited));
            }

            if !wait.is_zero() {
                trace!(
                    message = "Waiting for capacity.",
                    endpoint,
                    round,
                    wait_ms = wait.as_millis() as u64,
                );
                sleep(wait).await;
            }

            let now = instant_now();
            let waited = now.saturating_duration_since(started);
            let admitted = {
                let mut guard = lock(&state);
                if guard.try_admit(tokens, now) {
                    guard.stats.record_granted(waited);
                    Some(guard.capacities(now))
                } else {
                    None
                }
            };

            if let Some((requests, tokens)) = admitted {
                self.emit(RateLimitEvent::AcquisitionGranted { endpoint, waited });
                self.emit(RateLimitEvent::BucketCapacity {
                    endpoint,
                    requests,
                    tokens,
                });
                return Ok(Acquisition::granted(waited));
            }

            debug!(message = "Capacity taken by a concurrent caller.", endpoint, round);
        }

        let waited = instant_now().saturating_duration_since(started);
        Ok(self.reject(&state, endpoint, RejectReason::Contended, waited))
    }

    /// Records a successful call.
    ///
    /// `actual_tokens_used` only feeds the statistics: tokens taken at acquire
    /// time on the basis of the estimate are not corrected afterwards.
    pub fn record_success(&self, endpoint: &str, actual_tokens_used: Option<u64>) {
        let state = self.endpoint(endpoint);
        let adjusted = {
            let mut guard = lock(&state);
            guard.stats.record_success(actual_tokens_used);
            guard.maybe_adjust(instant_now())
        };
        self.emit(RateLimitEvent::Success { endpoint });
        self.report_adjustment(endpoint, adjusted);
    }

    pub fn record_failure(&self, endpoint: &str) {
        let state = self.endpoint(endpoint);
        let adjusted = {
            let mut guard = lock(&state);
            guard.stats.record_failure();
            guard.maybe_adjust(instant_now())
        };
        self.emit(RateLimitEvent::Failure { endpoint });
        self.report_adjustment(endpoint, adjusted);
    }

    /// Records a throttle signal and decreases the endpoint's rates right away.
    ///
    /// The decrease closes the current window, so the same signal is not
    /// penalised a second time at the next boundary.
    pub fn record_throttled(&self, endpoint: &str) {
        let state = self.endpoint(endpoint);
        let (previous, targets) = {
            let mut guard = lock(&state);
            guard.stats.record_throttled();
            let previous = RateTargets::of(&guard.stats);
            let targets = previous.decreased(&guard.settings);
            guard.apply(targets, instant_now());
            (previous, targets)
        };

        warn!(
            message = "Endpoint throttled; decreasing rate.",
            endpoint,
            previous_requests_per_minute = previous.requests_per_minute,
            requests_per_minute = targets.requests_per_minute,
            tokens_per_minute = targets.tokens_per_minute,
        );
        self.emit(RateLimitEvent::Throttled { endpoint });
        self.emit_rates(endpoint, targets);
    }

    fn report_adjustment(&self, endpoint: &str, adjusted: Option<(RateRegime, RateTargets)>) {
        let Some((regime, targets)) = adjusted else {
            return;
        };
        match regime {
            RateRegime::Neutral => debug!(
                message = "Window closed without rate change.",
                endpoint,
                regime = regime.as_str(),
            ),
            RateRegime::Steady | RateRegime::Degraded => info!(
                message = "Rate adjusted.",
                endpoint,
                regime = regime.as_str(),
                requests_per_minute = targets.requests_per_minute,
                tokens_per_minute = targets.tokens_per_minute,
            ),
        }
        self.emit_rates(endpoint, targets);
    }

    /// Snapshot of `endpoint`, or `None` if it has not been seen yet.
    pub fn status(&self, endpoint: &str) -> Option<EndpointStatus> {
        let state = self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()?;
        let guard = lock(&state);
        let now = instant_now();
        let (requests, tokens) = guard.capacities(now);
        Some(guard.stats.status(requests, tokens, now))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;
    use tokio::time::advance;

    use super::*;
    use crate::test_utils::{RecordingSink, trace_init};

    const CHAT: &str = "chat/completions";

    fn limiter(settings: RateLimitSettings) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(settings).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn first_acquire_takes_exactly_one_request() {
        let limiter = limiter(
            RateLimitSettings::builder()
                .initial_requests_per_minute(60.0)
                .burst_multiplier(1.5)
                .build(),
        );

        let acquisition = limiter.acquire(CHAT, 0, Duration::ZERO).await.unwrap();
        assert_eq!(acquisition, Acquisition::granted(Duration::ZERO));

        let status = limiter.status(CHAT).unwrap();
        assert_eq!(status.request_capacity, 89.0);
    }

    #[tokio::test(start_paused = true)]
    async fn unseen_endpoint_is_created_with_defaults() {
        let limiter = limiter(RateLimitSettings::default());
        assert!(limiter.status("embeddings").is_none());

        let acquisition = limiter.acquire("embeddings", 1_000, Duration::ZERO).await.unwrap();
        assert!(acquisition.acquired);

        let status = limiter.status("embeddings").unwrap();
        assert_eq!(status.current_requests_per_minute, 60.0);
        assert_eq!(status.current_tokens_per_minute, 40_000.0);
        assert_eq!(status.token_capacity, 59_000.0);
        assert_eq!(status.acquisitions_granted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_endpoint_is_a_precondition_violation() {
        let limiter = limiter(RateLimitSettings::default());
        let error = limiter.acquire("", 1, Duration::ZERO).await.unwrap_err();
        assert!(matches!(error, RateLimitError::PreconditionViolation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn impossible_request_is_rejected_without_waiting() {
        let limiter = limiter(
            RateLimitSettings::builder()
                .initial_tokens_per_minute(1_000.0)
                .build(),
        );
        let started = Instant::now();

        let acquisition = limiter
            .acquire(CHAT, 1_501, Duration::from_secs(3_600))
            .await
            .unwrap();

        assert!(!acquisition.acquired);
        assert_eq!(acquisition.rejection, Some(RejectReason::ExceedsBurst));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(limiter.status(CHAT).unwrap().request_capacity, 90.0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_beyond_max_wait_consumes_nothing() {
        let limiter = limiter(
            RateLimitSettings::builder()
                .initial_requests_per_minute(6.0)
                .burst_multiplier(0.5)
                .build(),
        );
        for _ in 0..3 {
            assert!(limiter.acquire(CHAT, 10, Duration::ZERO).await.unwrap().acquired);
        }
        let tokens_before = limiter.status(CHAT).unwrap().token_capacity;

        let acquisition = limiter.acquire(CHAT, 10, Duration::from_secs(5)).await.unwrap();

        assert_eq!(
            acquisition,
            Acquisition::rejected(RejectReason::WaitTooLong, Duration::ZERO)
        );
        let status = limiter.status(CHAT).unwrap();
        assert_eq!(status.token_capacity, tokens_before);
        assert_eq!(status.acquisitions_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_refill_when_allowed() {
        let limiter = limiter(
            RateLimitSettings::builder()
                .initial_requests_per_minute(6.0)
                .burst_multiplier(0.5)
                .build(),
        );
        for _ in 0..3 {
            assert!(limiter.acquire(CHAT, 0, Duration::ZERO).await.unwrap().acquired);
        }

        let acquisition = limiter.acquire(CHAT, 0, Duration::from_secs(60)).await.unwrap();

        assert!(acquisition.acquired);
        assert!(acquisition.waited >= Duration::from_secs(10));
        assert!(acquisition.waited < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_windows_increase_rate_up_to_max() {
        let limiter = limiter(
            RateLimitSettings::builder()
                .initial_requests_per_minute(60.0)
                .max_requests_per_minute(68.0)
                .build(),
        );

        for expected in [65.0, 68.0, 68.0] {
            for _ in 0..10 {
                limiter.record_success(CHAT, Some(100));
            }
            advance(Duration::from_secs(60)).await;
            limiter.record_success(CHAT, Some(100));

            let status = limiter.status(CHAT).unwrap();
            assert_eq!(status.current_requests_per_minute, expected);
            assert_eq!(status.success_count, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rates_do_not_change_mid_window() {
        let limiter = limiter(RateLimitSettings::default());
        for _ in 0..50 {
            limiter.record_success(CHAT, None);
        }
        advance(Duration::from_secs(30)).await;
        limiter.record_success(CHAT, None);

        let status = limiter.status(CHAT).unwrap();
        assert_eq!(status.current_requests_per_minute, 60.0);
        assert_eq!(status.success_count, 51);
    }

    #[tokio::test(start_paused = true)]
    async fn full_window_closes_before_interval() {
        let limiter = limiter(RateLimitSettings::default());
        for _ in 0..100 {
            limiter.record_success(CHAT, None);
        }
        assert_eq!(limiter.status(CHAT).unwrap().current_requests_per_minute, 65.0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_decreases_rate_immediately() {
        let limiter = limiter(RateLimitSettings::default());
        limiter.record_success(CHAT, None);

        limiter.record_throttled(CHAT);

        let status = limiter.status(CHAT).unwrap();
        assert_eq!(status.current_requests_per_minute, 30.0);
        assert_eq!(status.current_tokens_per_minute, 20_000.0);
        assert_eq!(status.request_capacity, 45.0);
        assert_eq!(status.total_throttles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_throttles_stop_at_minimum() {
        let limiter = limiter(
            RateLimitSettings::builder()
                .min_requests_per_minute(10.0)
                .build(),
        );
        for _ in 0..10 {
            limiter.record_throttled(CHAT);
        }
        assert_eq!(limiter.status(CHAT).unwrap().current_requests_per_minute, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_window_decreases_rate() {
        let limiter = limiter(RateLimitSettings::default());
        for _ in 0..3 {
            limiter.record_success(CHAT, None);
        }
        for _ in 0..7 {
            limiter.record_failure(CHAT);
        }
        advance(Duration::from_secs(60)).await;
        limiter.record_failure(CHAT);

        assert_eq!(limiter.status(CHAT).unwrap().current_requests_per_minute, 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn neutral_window_keeps_rate() {
        let limiter = limiter(RateLimitSettings::default());
        for _ in 0..8 {
            limiter.record_success(CHAT, None);
        }
        limiter.record_failure(CHAT);
        advance(Duration::from_secs(60)).await;
        limiter.record_failure(CHAT);

        let status = limiter.status(CHAT).unwrap();
        assert_eq!(status.current_requests_per_minute, 60.0);
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn endpoints_are_independent() {
        let limiter = limiter(RateLimitSettings::default());
        limiter
            .register_endpoint(
                "embeddings",
                RateLimitSettings::builder()
                    .initial_requests_per_minute(300.0)
                    .build(),
            )
            .unwrap();

        limiter.record_throttled(CHAT);

        assert_eq!(limiter.status(CHAT).unwrap().current_requests_per_minute, 30.0);
        assert_eq!(
            limiter.status("embeddings").unwrap().current_requests_per_minute,
            300.0
        );
        let mut names = limiter.endpoint_names();
        names.sort();
        assert_eq!(names, vec!["chat/completions", "embeddings"]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_double_spend() {
        trace_init();
        // 20 RPM with a 0.5 multiplier: 10 requests of burst, one more every 3s.
        let limiter = Arc::new(limiter(
            RateLimitSettings::builder()
                .initial_requests_per_minute(20.0)
                .burst_multiplier(0.5)
                .build(),
        ));

        let handles = (0..50).map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(CHAT, 1, Duration::ZERO).await })
        });
        let granted = join_all(handles)
            .await
            .into_iter()
            .filter(|result| result.as_ref().unwrap().as_ref().unwrap().acquired)
            .count();

        assert_eq!(granted, 10);
        assert_eq!(limiter.status(CHAT).unwrap().acquisitions_rejected, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_stay_within_refilled_capacity() {
        // 60 RPM with a 0.25 multiplier: 15 requests of burst, one more per second.
        let limiter = Arc::new(limiter(
            RateLimitSettings::builder()
                .initial_requests_per_minute(60.0)
                .burst_multiplier(0.25)
                .build(),
        ));
        let started = Instant::now();
        let granted = Arc::new(AtomicUsize::new(0));

        let handles = (0..50).map(|_| {
            let limiter = Arc::clone(&limiter);
            let granted = Arc::clone(&granted);
            tokio::spawn(async move {
                let acquisition = limiter.acquire(CHAT, 1, Duration::from_secs(5)).await.unwrap();
                if acquisition.acquired {
                    granted.fetch_add(1, Ordering::SeqCst);
                }
            })
        });
        join_all(handles).await;

        let granted = granted.load(Ordering::SeqCst) as f64;
        let supplied = 15.0 + started.elapsed().as_secs_f64();
        assert!(granted >= 15.0);
        assert!(granted <= supplied + 1e-9, "granted {granted}, supplied {supplied}");
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gives_up_after_losing_two_rounds() {
        // 6000 TPM: 100 tokens per second, 9000 tokens of burst.
        let limiter = Arc::new(limiter(
            RateLimitSettings::builder()
                .initial_tokens_per_minute(6_000.0)
                .build(),
        ));
        assert!(limiter.acquire(CHAT, 9_000, Duration::ZERO).await.unwrap().acquired);

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(CHAT, 600, Duration::from_secs(3_600)).await })
        };

        // The waiter wakes at 6s to find 300 tokens, then again at 9s to find 150.
        sleep(Duration::from_secs(3)).await;
        assert!(limiter.acquire(CHAT, 300, Duration::ZERO).await.unwrap().acquired);
        sleep(Duration::from_millis(4_500)).await;
        assert!(limiter.acquire(CHAT, 450, Duration::ZERO).await.unwrap().acquired);

        let acquisition = waiter.await.unwrap().unwrap();

        assert_eq!(
            acquisition,
            Acquisition::rejected(RejectReason::Contended, Duration::from_secs(9))
        );
        let status = limiter.status(CHAT).unwrap();
        assert_eq!(status.token_capacity, 150.0);
        assert_eq!(status.acquisitions_granted, 3);
        assert_eq!(status.acquisitions_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reregistering_keeps_buckets_and_totals() {
        let limiter = Arc::new(limiter(RateLimitSettings::default()));
        for _ in 0..80 {
            assert!(limiter.acquire(CHAT, 0, Duration::ZERO).await.unwrap().acquired);
        }
        limiter.record_success(CHAT, Some(10));

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(CHAT, 0, Duration::from_secs(60)).await })
        };
        for _ in 0..10 {
            assert!(limiter.acquire(CHAT, 0, Duration::ZERO).await.unwrap().acquired);
        }
        tokio::task::yield_now().await;

        limiter
            .register_endpoint(
                CHAT,
                RateLimitSettings::builder()
                    .initial_requests_per_minute(120.0)
                    .build(),
            )
            .unwrap();

        let status = limiter.status(CHAT).unwrap();
        assert_eq!(status.current_requests_per_minute, 120.0);
        assert!(status.request_capacity < 1.0);
        assert_eq!(status.acquisitions_granted, 90);
        assert_eq!(status.total_successes, 1);

        // The waiter took its unit from the same bucket, now refilling at 2 per second.
        let acquisition = waiter.await.unwrap().unwrap();
        assert_eq!(acquisition, Acquisition::granted(Duration::from_secs(1)));
        let status = limiter.status(CHAT).unwrap();
        assert_eq!(status.acquisitions_granted, 91);
        assert_eq!(status.request_capacity, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn largest_burst_follows_max_rate() {
        let limiter = limiter(RateLimitSettings::default());
        limiter
            .register_endpoint(
                "embeddings",
                RateLimitSettings::builder()
                    .max_tokens_per_minute(2_000_000.0)
                    .burst_multiplier(2.0)
                    .build(),
            )
            .unwrap();

        assert_eq!(limiter.largest_token_burst(CHAT).unwrap(), 1_500_000.0);
        assert_eq!(limiter.largest_token_burst("embeddings").unwrap(), 4_000_000.0);
        assert!(limiter.largest_token_burst("").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sink_does_not_break_admission() {
        let sink = Arc::new(RecordingSink::failing());
        let limiter = AdaptiveRateLimiter::with_sink(RateLimitSettings::default(), sink.clone()).unwrap();

        assert!(limiter.acquire(CHAT, 1, Duration::ZERO).await.unwrap().acquired);
        limiter.record_throttled(CHAT);

        assert!(sink.count("throttled") >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_sees_grants_and_rejections() {
        let sink = Arc::new(RecordingSink::default());
        let limiter = AdaptiveRateLimiter::with_sink(
            RateLimitSettings::builder()
                .initial_requests_per_minute(2.0)
                .burst_multiplier(0.5)
                .build(),
            sink.clone(),
        )
        .unwrap();

        assert!(limiter.acquire(CHAT, 1, Duration::ZERO).await.unwrap().acquired);
        assert!(!limiter.acquire(CHAT, 1, Duration::ZERO).await.unwrap().acquired);

        assert_eq!(sink.count("granted"), 1);
        assert_eq!(sink.count("rejected"), 1);
        assert_eq!(sink.count("rate_adjusted"), 1);
    }

    #[test]
    fn invalid_settings_are_refused() {
        let settings = RateLimitSettings::builder().burst_multiplier(0.0).build();
        assert!(matches!(
            AdaptiveRateLimiter::new(settings),
            Err(RateLimitError::InvalidSettings { .. })
        ));
    }
}

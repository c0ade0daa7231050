//! Drives a simulated provider that answers 429 above 5 requests per second and
//! prints how the limiter settles on the provider's real limit.
//!
//! ```sh
//! RUST_LOG=info,adaptive_rate_limiter=debug cargo run --example simulated_remote
//! ```

use std::{
    collections::VecDeque,
    env,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use adaptive_rate_limiter::adaptive_rate_limit::{
    AdaptiveRateLimiter, BackoffExecutor, BackoffSettings, Outcome, RateLimitSettings,
    internal_event::TracingSink,
};
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ENDPOINT: &str = "chat/completions";
const ENV_DEMO_REQUESTS: &str = "DEMO_REQUESTS";

/// Provider-side sliding window: at most `limit` calls per second.
struct SimulatedProvider {
    limit: usize,
    calls: Mutex<VecDeque<Instant>>,
}

impl SimulatedProvider {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    async fn complete(&self, prompt: usize) -> Outcome<String> {
        tokio::time::sleep(Duration::from_millis(50)).await;

        let now = Instant::now();
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        while calls
            .front()
            .is_some_and(|call| now.duration_since(*call) >= Duration::from_secs(1))
        {
            calls.pop_front();
        }
        if calls.len() >= self.limit {
            return Outcome::RateLimited {
                retry_after: Some(Duration::from_millis(200)),
            };
        }
        calls.push_back(now);

        Outcome::Success {
            payload: format!("completion #{prompt}"),
            used_tokens: Some(180),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), adaptive_rate_limiter::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let requests: usize = env_or(ENV_DEMO_REQUESTS, 60);
    let settings = RateLimitSettings::builder()
        .initial_requests_per_minute(600.0)
        .initial_tokens_per_minute(200_000.0)
        .burst_multiplier(0.05)
        .min_samples(5)
        .adjustment_interval_secs(2)
        .build();
    let limiter = Arc::new(AdaptiveRateLimiter::with_sink(settings, Arc::new(TracingSink))?);
    let executor = BackoffExecutor::new(
        Arc::clone(&limiter),
        BackoffSettings::builder()
            .base_delay_ms(100)
            .max_delay_secs(5)
            .acquire_max_wait_secs(10)
            .build(),
    );
    let provider = Arc::new(SimulatedProvider::new(5));

    let started = Instant::now();
    let tasks = (0..requests).map(|prompt| {
        let executor = executor.clone();
        let provider = Arc::clone(&provider);
        tokio::spawn(async move {
            executor
                .execute(ENDPOINT, 150, |_| provider.complete(prompt))
                .await
        })
    });

    let mut completed = 0;
    for result in join_all(tasks).await {
        match result? {
            Ok(_) => completed += 1,
            Err(error) => warn!(message = "Request dropped.", %error),
        }
    }

    info!(
        message = "Run finished.",
        completed,
        requests,
        elapsed_ms = started.elapsed().as_millis() as u64,
    );
    if let Some(status) = limiter.status(ENDPOINT) {
        println!("{}", serde_json::to_string_pretty(&status)?);
    }
    Ok(())
}

use std::time::Duration;

use tokio::time::Instant;

use super::instant_now;

/// A continuously refilling capacity counter for one resource dimension.
///
/// Refill is lazy: nothing runs in the background, the capacity owed for the time
/// elapsed since the last computation is added whenever the bucket is consulted.
/// The invariant `0 <= capacity <= burst_capacity` holds after every operation.
///
/// The bucket itself is not synchronized. [`AdaptiveRateLimiter`] keeps each
/// endpoint's request and token buckets behind one mutex so that
/// refill-check-subtract happens as a single step for both dimensions.
///
/// [`AdaptiveRateLimiter`]: super::AdaptiveRateLimiter
#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate_per_second: f64,
    burst_capacity: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(refill_rate_per_second: f64, burst_capacity: f64) -> Self {
        Self::starting_at(refill_rate_per_second, burst_capacity, instant_now())
    }

    pub(crate) fn starting_at(refill_rate_per_second: f64, burst_capacity: f64, now: Instant) -> Self {
        let burst_capacity = burst_capacity.max(0.0);
        Self {
            capacity: burst_capacity,
            refill_rate_per_second: refill_rate_per_second.max(0.0),
            burst_capacity,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn burst_capacity(&self) -> f64 {
        self.burst_capacity
    }

    pub fn refill_rate_per_second(&self) -> f64 {
        self.refill_rate_per_second
    }

    /// Capacity the bucket would hold at `now`, without recording the refill.
    fn projected(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.capacity + elapsed * self.refill_rate_per_second).min(self.burst_capacity)
    }

    fn refill(&mut self, now: Instant) {
        // Clock readings taken before the last refill must not move it backwards.
        if now > self.last_refill {
            self.capacity = self.projected(now);
            self.last_refill = now;
        }
    }

    /// Refills, then takes `amount` if the bucket holds at least that much.
    ///
    /// Returns `false` without touching the capacity when there is not enough,
    /// and immediately when `amount` exceeds the burst capacity, since such a
    /// request can never be satisfied.
    pub fn try_consume(&mut self, amount: f64) -> bool {
        self.try_consume_at(amount, instant_now())
    }

    pub(crate) fn try_consume_at(&mut self, amount: f64, now: Instant) -> bool {
        self.refill(now);
        if !self.can_consume(amount) {
            return false;
        }
        self.capacity = (self.capacity - amount).max(0.0);
        true
    }

    /// Refills and reports whether `amount` could be taken right now.
    pub(crate) fn has_capacity_at(&mut self, amount: f64, now: Instant) -> bool {
        self.refill(now);
        self.can_consume(amount)
    }

    fn can_consume(&self, amount: f64) -> bool {
        // NaN and negative amounts would break the lower bound.
        amount >= 0.0 && amount <= self.burst_capacity && self.capacity >= amount
    }

    /// How long until `amount` becomes available, or `None` if it never will.
    ///
    /// `None` is returned when `amount` exceeds the burst capacity or the bucket
    /// does not refill at all. Zero means the amount is available now.
    pub fn time_until_available(&self, amount: f64) -> Option<Duration> {
        self.time_until_available_at(amount, instant_now())
    }

    pub(crate) fn time_until_available_at(&self, amount: f64, now: Instant) -> Option<Duration> {
        if !(amount >= 0.0) || amount > self.burst_capacity {
            return None;
        }

        let deficit = amount - self.projected(now);
        if deficit <= 0.0 {
            return Some(Duration::ZERO);
        }
        if self.refill_rate_per_second <= 0.0 {
            return None;
        }

        // Rounded up so that sleeping for the result always covers the deficit.
        let nanos = (deficit / self.refill_rate_per_second * 1e9).ceil();
        if !nanos.is_finite() || nanos >= u64::MAX as f64 {
            return None;
        }
        Some(Duration::from_nanos(nanos as u64))
    }

    /// Capacity at `now` without recording the refill.
    pub(crate) fn capacity_at(&self, now: Instant) -> f64 {
        self.projected(now)
    }

    /// Changes the steady-state rate and the bucket size.
    ///
    /// Capacity accrued under the old rate is settled first; the current capacity
    /// is otherwise kept, only clamped down if it no longer fits.
    pub fn set_refill_rate(&mut self, refill_rate_per_second: f64, burst_capacity: f64) {
        self.set_refill_rate_at(refill_rate_per_second, burst_capacity, instant_now());
    }

    pub(crate) fn set_refill_rate_at(
        &mut self,
        refill_rate_per_second: f64,
        burst_capacity: f64,
        now: Instant,
    ) {
        self.refill(now);
        self.refill_rate_per_second = refill_rate_per_second.max(0.0);
        self.burst_capacity = burst_capacity.max(0.0);
        self.capacity = self.capacity.min(self.burst_capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_bounds(bucket: &TokenBucket) {
        assert!(bucket.capacity() >= 0.0, "capacity below zero: {:?}", bucket);
        assert!(
            bucket.capacity() <= bucket.burst_capacity(),
            "capacity above burst: {:?}",
            bucket
        );
    }

    #[test]
    fn starts_full() {
        let bucket = TokenBucket::new(1.0, 90.0);
        assert_eq!(bucket.capacity(), 90.0);
    }

    #[test]
    fn consume_subtracts_exactly() {
        let now = Instant::now();
        let mut bucket = TokenBucket::starting_at(1.0, 90.0, now);

        assert!(bucket.try_consume_at(1.0, now));
        assert_eq!(bucket.capacity(), 89.0);
    }

    #[test]
    fn insufficient_capacity_leaves_bucket_untouched() {
        let now = Instant::now();
        let mut bucket = TokenBucket::starting_at(1.0, 10.0, now);

        assert!(bucket.try_consume_at(8.0, now));
        assert!(!bucket.try_consume_at(5.0, now));
        assert_eq!(bucket.capacity(), 2.0);
    }

    #[test]
    fn amount_above_burst_never_succeeds() {
        let now = Instant::now();
        let mut bucket = TokenBucket::starting_at(100.0, 10.0, now);

        assert!(!bucket.try_consume_at(10.5, now));
        assert_eq!(bucket.time_until_available_at(10.5, now), None);
        assert_eq!(bucket.capacity(), 10.0);
    }

    #[test]
    fn negative_amount_is_refused() {
        let now = Instant::now();
        let mut bucket = TokenBucket::starting_at(1.0, 10.0, now);

        assert!(!bucket.try_consume_at(-3.0, now));
        assert!(!bucket.try_consume_at(f64::NAN, now));
        assert_eq!(bucket.capacity(), 10.0);
    }

    #[test]
    fn refills_continuously_up_to_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::starting_at(2.0, 10.0, start);
        assert!(bucket.try_consume_at(10.0, start));

        assert!(bucket.try_consume_at(1.0, start + Duration::from_millis(500)));
        assert_eq!(bucket.capacity(), 0.0);

        bucket.refill(start + Duration::from_millis(1_750));
        assert!((bucket.capacity() - 2.5).abs() < 1e-9);

        bucket.refill(start + Duration::from_secs(3_600));
        assert_eq!(bucket.capacity(), 10.0);
    }

    #[test]
    fn time_until_available_is_pure() {
        let start = Instant::now();
        let mut bucket = TokenBucket::starting_at(2.0, 10.0, start);
        assert!(bucket.try_consume_at(10.0, start));

        let later = start + Duration::from_secs(1);
        assert_eq!(bucket.time_until_available_at(4.0, later), Some(Duration::from_secs(1)));
        assert_eq!(bucket.time_until_available_at(2.0, later), Some(Duration::ZERO));
        assert_eq!(bucket.capacity(), 0.0);
    }

    #[test]
    fn zero_refill_rate_never_becomes_available() {
        let now = Instant::now();
        let mut bucket = TokenBucket::starting_at(0.0, 5.0, now);
        assert!(bucket.try_consume_at(5.0, now));

        assert_eq!(bucket.time_until_available_at(1.0, now), None);
        assert_eq!(bucket.time_until_available_at(0.0, now), Some(Duration::ZERO));
    }

    #[test]
    fn shrinking_burst_clamps_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::starting_at(1.5, 90.0, now);

        bucket.set_refill_rate_at(0.75, 45.0, now);
        assert_eq!(bucket.capacity(), 45.0);
        assert_eq!(bucket.refill_rate_per_second(), 0.75);
    }

    #[test]
    fn growing_burst_keeps_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::starting_at(1.0, 60.0, now);
        assert!(bucket.try_consume_at(20.0, now));

        bucket.set_refill_rate_at(2.0, 120.0, now);
        assert_eq!(bucket.capacity(), 40.0);
        assert_eq!(bucket.burst_capacity(), 120.0);
    }

    #[test]
    fn bounds_hold_across_mixed_operations() {
        let start = Instant::now();
        let mut bucket = TokenBucket::starting_at(3.0, 12.0, start);
        let amounts = [5.0, 0.0, 7.5, 12.0, 1.0, 13.0, 2.25, 6.0, 0.5, 11.0];

        for (step, amount) in amounts.iter().enumerate() {
            let now = start + Duration::from_millis(step as u64 * 700);
            bucket.try_consume_at(*amount, now);
            assert_bounds(&bucket);

            if step % 3 == 0 {
                bucket.set_refill_rate_at(1.0 + step as f64, 4.0 + step as f64, now);
                assert_bounds(&bucket);
            }
        }
    }

    #[test]
    fn stale_clock_reading_does_not_rewind() {
        let start = Instant::now();
        let later = start + Duration::from_secs(5);
        let mut bucket = TokenBucket::starting_at(1.0, 10.0, start);

        assert!(bucket.try_consume_at(10.0, later));
        assert!(!bucket.try_consume_at(1.0, start));
        assert_eq!(bucket.capacity(), 0.0);
    }
}

//! Client-side send-rate limiting for [`RetryMode::Adaptive`](super::RetryMode::Adaptive).
//!
//! The limiter stays out of the way until the service throttles. From then on
//! every attempt takes a token from a bucket whose fill rate follows the CUBIC
//! congestion curve: cut on throttling, regrown on success.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::util::lock_unpoisoned;

const MIN_FILL_RATE: f64 = 0.5;
const MIN_CAPACITY: f64 = 1.0;
const SMOOTH: f64 = 0.8;
const BETA: f64 = 0.7;
const SCALE_CONSTANT: f64 = 0.4;
/// Measured send rate is sampled in half-second buckets.
const TX_RATE_BUCKETS_PER_SECOND: f64 = 2.0;

#[derive(Debug)]
struct LimiterState {
    enabled: bool,
    fill_rate: f64,
    max_capacity: f64,
    current_capacity: f64,
    last_refill: Option<f64>,
    measured_tx_rate: f64,
    last_tx_rate_bucket: f64,
    request_count: u64,
    last_max_rate: f64,
    last_throttle: f64,
    time_window: f64,
}

impl LimiterState {
    fn new(now: f64) -> Self {
        Self {
            enabled: false,
            fill_rate: 0.0,
            max_capacity: 0.0,
            current_capacity: 0.0,
            last_refill: None,
            measured_tx_rate: 0.0,
            last_tx_rate_bucket: (now * TX_RATE_BUCKETS_PER_SECOND).floor() / TX_RATE_BUCKETS_PER_SECOND,
            request_count: 0,
            last_max_rate: 0.0,
            last_throttle: now,
            time_window: 0.0,
        }
    }

    fn refill(&mut self, now: f64) {
        let Some(last) = self.last_refill else {
            self.last_refill = Some(now);
            return;
        };
        if now > last {
            let filled = (now - last) * self.fill_rate;
            self.current_capacity = (self.current_capacity + filled).min(self.max_capacity);
            self.last_refill = Some(now);
        }
    }

    /// Takes one token; the balance may go negative so concurrent senders queue.
    fn acquire(&mut self, now: f64) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        self.refill(now);
        let wait = if self.current_capacity >= 1.0 {
            0.0
        } else {
            (1.0 - self.current_capacity) / self.fill_rate
        };
        self.current_capacity -= 1.0;
        wait
    }

    fn update_measured_rate(&mut self, now: f64) {
        let bucket = (now * TX_RATE_BUCKETS_PER_SECOND).floor() / TX_RATE_BUCKETS_PER_SECOND;
        self.request_count += 1;
        if bucket > self.last_tx_rate_bucket {
            let current_rate = self.request_count as f64 / (bucket - self.last_tx_rate_bucket);
            self.measured_tx_rate = current_rate * SMOOTH + self.measured_tx_rate * (1.0 - SMOOTH);
            self.request_count = 0;
            self.last_tx_rate_bucket = bucket;
        }
    }

    fn update_time_window(&mut self) {
        self.time_window = (self.last_max_rate * (1.0 - BETA) / SCALE_CONSTANT).cbrt();
    }

    fn cubic_success(&self, now: f64) -> f64 {
        let elapsed = now - self.last_throttle - self.time_window;
        SCALE_CONSTANT * elapsed.powi(3) + self.last_max_rate
    }

    fn update(&mut self, now: f64, throttled: bool) {
        self.update_measured_rate(now);
        let calculated = if throttled {
            let rate_to_use = if self.enabled {
                self.measured_tx_rate.min(self.fill_rate)
            } else {
                self.measured_tx_rate
            };
            self.last_max_rate = rate_to_use;
            self.update_time_window();
            self.last_throttle = now;
            self.enabled = true;
            rate_to_use * BETA
        } else {
            self.update_time_window();
            self.cubic_success(now)
        };
        let new_rate = calculated.min(2.0 * self.measured_tx_rate);
        self.refill(now);
        self.fill_rate = new_rate.max(MIN_FILL_RATE);
        self.max_capacity = new_rate.max(MIN_CAPACITY);
        self.current_capacity = self.current_capacity.min(self.max_capacity);
    }
}

/// CUBIC-paced token bucket shared by every attempt of a client.
#[derive(Debug)]
pub struct ClientRateLimiter {
    origin: Instant,
    state: Mutex<LimiterState>,
}

impl ClientRateLimiter {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(LimiterState::new(0.0)),
        }
    }

    /// Whether a throttling response has switched pacing on.
    pub fn is_enabled(&self) -> bool {
        lock_unpoisoned(&self.state).enabled
    }

    /// Current token fill rate in requests per second.
    pub fn fill_rate(&self) -> f64 {
        lock_unpoisoned(&self.state).fill_rate
    }

    /// Takes a send token and returns how long to wait before sending.
    pub fn acquire(&self) -> Duration {
        self.acquire_at(self.elapsed())
    }

    pub fn on_throttled(&self) {
        self.update_at(self.elapsed(), true);
    }

    pub fn on_success(&self) {
        self.update_at(self.elapsed(), false);
    }

    fn elapsed(&self) -> f64 {
        Instant::now().duration_since(self.origin).as_secs_f64()
    }

    pub(crate) fn acquire_at(&self, now: f64) -> Duration {
        let wait = lock_unpoisoned(&self.state).acquire(now);
        if wait <= f64::EPSILON || !wait.is_finite() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(wait)
    }

    pub(crate) fn update_at(&self, now: f64, throttled: bool) {
        let mut state = lock_unpoisoned(&self.state);
        state.update(now, throttled);
        debug!(
            throttled,
            fill_rate = state.fill_rate,
            measured_tx_rate = state.measured_tx_rate,
            "updated client send rate"
        );
    }
}

impl Default for ClientRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ClientRateLimiter;

    #[test]
    fn sends_freely_until_the_first_throttle() {
        let limiter = ClientRateLimiter::new();
        for step in 0..20 {
            assert_eq!(limiter.acquire_at(f64::from(step) * 0.01), Duration::ZERO);
            limiter.update_at(f64::from(step) * 0.01, false);
        }
        assert!(!limiter.is_enabled());
    }

    #[test]
    fn sustained_throttling_paces_sends() {
        let limiter = ClientRateLimiter::new();
        let mut now = 0.0;
        for _ in 0..10 {
            now += limiter.acquire_at(now).as_secs_f64() + 0.05;
            limiter.update_at(now, true);
        }
        assert!(limiter.is_enabled());

        let waits: Vec<Duration> = (0..3).map(|_| limiter.acquire_at(now)).collect();
        assert!(waits.iter().all(|wait| !wait.is_zero()));
        assert!(waits[0] < waits[1] && waits[1] < waits[2]);
        assert!(limiter.fill_rate() <= 1.0);
    }

    #[test]
    fn throttling_cuts_the_rate_and_success_regrows_it() {
        let limiter = ClientRateLimiter::new();
        let mut now = 0.0;
        for _ in 0..40 {
            now += 0.05;
            limiter.acquire_at(now);
            limiter.update_at(now, false);
        }
        // Sending at 20 requests per second when the service pushes back.
        limiter.update_at(now, true);
        let after_throttle = limiter.fill_rate();
        assert!(after_throttle < 20.0);
        assert!(after_throttle >= 0.5);

        for _ in 0..200 {
            now += 0.05;
            now += limiter.acquire_at(now).as_secs_f64();
            limiter.update_at(now, false);
        }
        assert!(limiter.fill_rate() > after_throttle);
    }
}

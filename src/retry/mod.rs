//! Retry decisions: classification, backoff and the shared capacity bucket.

pub mod classification;
mod rate_limiter;
mod token_bucket;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use rand::RngExt;
use tracing::debug;

pub use rate_limiter::ClientRateLimiter;
pub use token_bucket::{DEFAULT_RETRY_CAPACITY, RetryTokenBucket};

use crate::error::{Error, ErrorKind, RetryStopReason, TransportErrorKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryMode {
    #[default]
    Standard,
    /// Standard retries plus client-side send pacing once the service throttles.
    Adaptive,
    Legacy,
    Disabled,
}

impl RetryMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Adaptive => "adaptive",
            Self::Legacy => "legacy",
            Self::Disabled => "disabled",
        }
    }
}

impl FromStr for RetryMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "adaptive" => Ok(Self::Adaptive),
            "legacy" => Ok(Self::Legacy),
            "disabled" | "off" => Ok(Self::Disabled),
            _ => Err(Error::configuration(format!("unsupported retry mode: {value}"))),
        }
    }
}

/// Read-only view of a failed attempt handed to the retry engine.
#[derive(Clone, Debug)]
pub struct RetryPolicyContext {
    /// The attempt that just failed, 1-based.
    pub attempt: u32,
    pub error_kind: ErrorKind,
    pub error_code: Option<String>,
    pub status: Option<u16>,
    pub transport_error_kind: Option<TransportErrorKind>,
    pub elapsed: Duration,
    pub retry_after: Option<Duration>,
    /// Time left before the per-call deadline, when one is set.
    pub remaining_call_time: Option<Duration>,
    pub method: Method,
    pub body_replayable: bool,
}

impl RetryPolicyContext {
    pub fn new(attempt: u32, error_kind: ErrorKind, method: Method) -> Self {
        Self {
            attempt,
            error_kind,
            error_code: None,
            status: None,
            transport_error_kind: None,
            elapsed: Duration::ZERO,
            retry_after: None,
            remaining_call_time: None,
            method,
            body_replayable: true,
        }
    }

    pub fn is_throttling(&self) -> bool {
        self.error_kind == ErrorKind::Throttling
    }

    pub fn is_timeout(&self) -> bool {
        self.error_kind == ErrorKind::Timeout
            || self.transport_error_kind == Some(TransportErrorKind::Timeout)
    }
}

/// Overrides the default retryability of a failed attempt.
pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, context: &RetryPolicyContext) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryVerdict {
    Retry { delay: Duration, cost: u32 },
    Stop(RetryStopReason),
}

#[derive(Clone)]
pub struct RetryPolicy {
    mode: RetryMode,
    max_attempts: u32,
    base_delay: Duration,
    throttling_base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    retry_cost: u32,
    throttling_retry_cost: u32,
    timeout_retry_cost: u32,
    success_release: u32,
    capacity: u32,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("mode", &self.mode)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("throttling_base_delay", &self.throttling_base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("retry_cost", &self.retry_cost)
            .field("throttling_retry_cost", &self.throttling_retry_cost)
            .field("timeout_retry_cost", &self.timeout_retry_cost)
            .field("success_release", &self.success_release)
            .field("capacity", &self.capacity)
            .field("retry_classifier", &self.retry_classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            mode: RetryMode::Standard,
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            throttling_base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
            jitter: true,
            retry_cost: 5,
            throttling_retry_cost: 5,
            timeout_retry_cost: 10,
            success_release: 1,
            capacity: DEFAULT_RETRY_CAPACITY,
            retry_classifier: None,
        }
    }

    pub fn adaptive() -> Self {
        Self {
            mode: RetryMode::Adaptive,
            ..Self::standard()
        }
    }

    pub fn legacy() -> Self {
        Self {
            mode: RetryMode::Legacy,
            max_attempts: 4,
            ..Self::standard()
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: RetryMode::Disabled,
            max_attempts: 1,
            ..Self::standard()
        }
    }

    pub fn for_mode(mode: RetryMode) -> Self {
        match mode {
            RetryMode::Standard => Self::standard(),
            RetryMode::Adaptive => Self::adaptive(),
            RetryMode::Legacy => Self::legacy(),
            RetryMode::Disabled => Self::disabled(),
        }
    }

    /// Switches mode and resets max attempts to that mode's default.
    pub fn mode(mut self, mode: RetryMode) -> Self {
        self.mode = mode;
        self.max_attempts = Self::for_mode(mode).max_attempts;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Zero is allowed and makes every non-throttling retry immediate.
    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn throttling_base_delay(mut self, throttling_base_delay: Duration) -> Self {
        self.throttling_base_delay = throttling_base_delay;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn retry_cost(mut self, retry_cost: u32) -> Self {
        self.retry_cost = retry_cost;
        self
    }

    pub fn throttling_retry_cost(mut self, throttling_retry_cost: u32) -> Self {
        self.throttling_retry_cost = throttling_retry_cost;
        self
    }

    pub fn timeout_retry_cost(mut self, timeout_retry_cost: u32) -> Self {
        self.timeout_retry_cost = timeout_retry_cost;
        self
    }

    pub fn success_release(mut self, success_release: u32) -> Self {
        self.success_release = success_release;
        self
    }

    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn configured_mode(&self) -> RetryMode {
        self.mode
    }

    pub fn configured_max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn configured_capacity(&self) -> u32 {
        self.capacity
    }

    pub fn configured_max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Backoff before `attempt` (1-based) without jitter: zero for the first
    /// attempt, then `base * 2^(attempt - 2)` capped at the max delay.
    pub fn compute_delay(&self, attempt: u32, throttling: bool) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let base = if throttling {
            self.throttling_base_delay
        } else {
            self.base_delay
        };
        let exponent = (attempt - 2).min(31);
        base.saturating_mul(1_u32 << exponent).min(self.max_delay)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(0..=delay_ms))
    }

    /// Retryability of a failure; a configured classifier has the last word.
    pub fn is_retryable(&self, context: &RetryPolicyContext) -> bool {
        match &self.retry_classifier {
            Some(classifier) => classifier.should_retry(context),
            None => context.error_kind.is_retryable_by_default(),
        }
    }

    fn cost_for(&self, context: &RetryPolicyContext) -> u32 {
        if context.is_timeout() {
            self.timeout_retry_cost
        } else if context.is_throttling() {
            self.throttling_retry_cost
        } else {
            self.retry_cost
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// A [`RetryPolicy`] bound to its capacity bucket and, in adaptive mode, its
/// send-rate limiter.
#[derive(Clone, Debug)]
pub struct RetryStrategy {
    policy: RetryPolicy,
    bucket: Arc<RetryTokenBucket>,
    rate_limiter: Option<Arc<ClientRateLimiter>>,
}

impl RetryStrategy {
    pub fn new(policy: RetryPolicy) -> Self {
        let bucket = Arc::new(RetryTokenBucket::new(policy.capacity));
        Self::with_bucket(policy, bucket)
    }

    /// Shares `bucket` with other strategies, e.g. clients for the same service.
    pub fn with_bucket(policy: RetryPolicy, bucket: Arc<RetryTokenBucket>) -> Self {
        let rate_limiter =
            (policy.mode == RetryMode::Adaptive).then(|| Arc::new(ClientRateLimiter::new()));
        Self {
            policy,
            bucket,
            rate_limiter,
        }
    }

    pub fn rate_limiter(&self) -> Option<&Arc<ClientRateLimiter>> {
        self.rate_limiter.as_ref()
    }

    /// Delay the next attempt must wait before it is sent; zero outside adaptive mode.
    pub fn acquire_send_token(&self) -> Duration {
        self.rate_limiter
            .as_ref()
            .map_or(Duration::ZERO, |limiter| limiter.acquire())
    }

    /// Feeds an attempt outcome (`None` for success) to the send-rate limiter.
    pub fn observe_attempt(&self, error_kind: Option<ErrorKind>) {
        let Some(limiter) = &self.rate_limiter else {
            return;
        };
        match error_kind {
            None => limiter.on_success(),
            Some(ErrorKind::Throttling) => limiter.on_throttled(),
            Some(_) => {}
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn bucket(&self) -> &Arc<RetryTokenBucket> {
        &self.bucket
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Decides whether the failed attempt described by `context` is retried.
    /// Capacity is only withdrawn when every other check has passed.
    pub fn should_retry(&self, context: &RetryPolicyContext) -> RetryVerdict {
        if context.attempt >= self.policy.max_attempts {
            return RetryVerdict::Stop(RetryStopReason::MaxAttemptsReached);
        }
        if !self.policy.is_retryable(context) {
            return RetryVerdict::Stop(RetryStopReason::NotRetryable);
        }
        if !context.body_replayable {
            return RetryVerdict::Stop(RetryStopReason::BodyNotReplayable);
        }

        let backoff = self.policy.apply_jitter(
            self.policy
                .compute_delay(context.attempt.saturating_add(1), context.is_throttling()),
        );
        let delay = match context.retry_after {
            Some(hint) => backoff.max(hint.min(self.policy.max_delay)),
            None => backoff,
        };
        if let Some(remaining) = context.remaining_call_time
            && remaining <= delay
        {
            return RetryVerdict::Stop(RetryStopReason::CallDeadline);
        }

        let cost = self.policy.cost_for(context);
        if !self.bucket.try_acquire(cost) {
            debug!(
                cost,
                capacity = %format_args!("{}/{}", self.bucket.available(), self.bucket.capacity()),
                "retry capacity exhausted"
            );
            return RetryVerdict::Stop(RetryStopReason::CapacityExhausted);
        }
        debug!(
            attempt = context.attempt,
            cost,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            capacity = %format_args!("{}/{}", self.bucket.available(), self.bucket.capacity()),
            "retry capacity acquired"
        );
        RetryVerdict::Retry { delay, cost }
    }

    /// Records a successful call. `last_acquired` is the capacity withdrawn
    /// for the retry that led to this success, zero when none was made.
    pub fn on_success(&self, last_acquired: u32) -> u32 {
        let released = match self.policy.mode {
            RetryMode::Legacy => last_acquired,
            RetryMode::Standard | RetryMode::Adaptive | RetryMode::Disabled => {
                self.policy.success_release
            }
        };
        let balance = self.bucket.release(released);
        debug!(
            released,
            capacity = %format_args!("{balance}/{}", self.bucket.capacity()),
            "retry capacity released"
        );
        released
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::new(RetryPolicy::standard())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use http::Method;

    use super::{
        RetryClassifier, RetryMode, RetryPolicy, RetryPolicyContext, RetryStrategy, RetryVerdict,
    };
    use crate::error::{ErrorKind, RetryStopReason, TransportErrorKind};

    fn failure(attempt: u32, kind: ErrorKind) -> RetryPolicyContext {
        RetryPolicyContext::new(attempt, kind, Method::GET)
    }

    #[test]
    fn backoff_is_zero_first_then_doubles_up_to_max() {
        let policy = RetryPolicy::standard().max_delay(Duration::from_millis(350));
        assert_eq!(policy.compute_delay(1, false), Duration::ZERO);
        assert_eq!(policy.compute_delay(2, false), Duration::from_millis(100));
        assert_eq!(policy.compute_delay(3, false), Duration::from_millis(200));
        assert_eq!(policy.compute_delay(4, false), Duration::from_millis(350));
        assert_eq!(policy.compute_delay(40, false), Duration::from_millis(350));
        assert_eq!(policy.compute_delay(2, true), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_computed_delay() {
        let policy = RetryPolicy::standard();
        for _ in 0..256 {
            assert!(policy.apply_jitter(Duration::from_millis(400)) <= Duration::from_millis(400));
        }
        assert_eq!(
            policy.clone().jitter(false).apply_jitter(Duration::from_millis(400)),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn max_attempts_is_checked_before_capacity() {
        let strategy = RetryStrategy::new(RetryPolicy::standard().jitter(false));
        assert_eq!(
            strategy.should_retry(&failure(3, ErrorKind::Throttling)),
            RetryVerdict::Stop(RetryStopReason::MaxAttemptsReached)
        );
        assert_eq!(strategy.bucket().available(), 500);
    }

    #[test]
    fn costs_depend_on_failure_kind() {
        let strategy = RetryStrategy::new(RetryPolicy::standard().base_delay(Duration::ZERO));
        assert_eq!(
            strategy.should_retry(&failure(1, ErrorKind::TransientService)),
            RetryVerdict::Retry {
                delay: Duration::ZERO,
                cost: 5
            }
        );
        let mut timeout = failure(1, ErrorKind::Transport);
        timeout.transport_error_kind = Some(TransportErrorKind::Timeout);
        assert!(matches!(
            strategy.should_retry(&timeout),
            RetryVerdict::Retry { cost: 10, .. }
        ));
        assert_eq!(strategy.bucket().available(), 485);
    }

    #[test]
    fn non_retryable_and_unreplayable_failures_stop_without_cost() {
        let strategy = RetryStrategy::default();
        assert_eq!(
            strategy.should_retry(&failure(1, ErrorKind::ModeledService)),
            RetryVerdict::Stop(RetryStopReason::NotRetryable)
        );
        let mut streaming = failure(1, ErrorKind::Transport);
        streaming.body_replayable = false;
        assert_eq!(
            strategy.should_retry(&streaming),
            RetryVerdict::Stop(RetryStopReason::BodyNotReplayable)
        );
        assert_eq!(strategy.bucket().available(), 500);
    }

    #[test]
    fn retry_after_hint_raises_delay_and_deadline_stops_before_acquiring() {
        let strategy = RetryStrategy::new(RetryPolicy::standard().jitter(false));
        let mut hinted = failure(1, ErrorKind::TransientService);
        hinted.retry_after = Some(Duration::from_secs(2));
        assert!(matches!(
            strategy.should_retry(&hinted),
            RetryVerdict::Retry { delay, .. } if delay == Duration::from_secs(2)
        ));

        hinted.retry_after = Some(Duration::from_secs(60));
        assert!(matches!(
            strategy.should_retry(&hinted),
            RetryVerdict::Retry { delay, .. } if delay == Duration::from_secs(20)
        ));

        let before = strategy.bucket().available();
        hinted.remaining_call_time = Some(Duration::from_secs(1));
        assert_eq!(
            strategy.should_retry(&hinted),
            RetryVerdict::Stop(RetryStopReason::CallDeadline)
        );
        assert_eq!(strategy.bucket().available(), before);
    }

    #[test]
    fn exhausted_bucket_refuses_any_retry() {
        let strategy = RetryStrategy::new(RetryPolicy::standard().capacity(5).max_attempts(10));
        assert!(matches!(
            strategy.should_retry(&failure(1, ErrorKind::Throttling)),
            RetryVerdict::Retry { .. }
        ));
        assert_eq!(
            strategy.should_retry(&failure(2, ErrorKind::Throttling)),
            RetryVerdict::Stop(RetryStopReason::CapacityExhausted)
        );
    }

    #[test]
    fn success_release_depends_on_mode() {
        let standard = RetryStrategy::new(RetryPolicy::standard().base_delay(Duration::ZERO));
        assert!(matches!(
            standard.should_retry(&failure(1, ErrorKind::TransientService)),
            RetryVerdict::Retry { .. }
        ));
        assert_eq!(standard.bucket().available(), 495);
        assert_eq!(standard.on_success(5), 1);
        assert_eq!(standard.bucket().available(), 496);

        let legacy = RetryStrategy::new(RetryPolicy::legacy());
        assert_eq!(legacy.max_attempts(), 4);
        legacy.bucket().try_acquire(5);
        assert_eq!(legacy.on_success(5), 5);
        assert_eq!(legacy.bucket().available(), 500);

        assert_eq!(RetryPolicy::for_mode(RetryMode::Disabled).configured_max_attempts(), 1);
        assert_eq!("LEGACY".parse::<RetryMode>().ok(), Some(RetryMode::Legacy));
        assert!("adaptive-ish".parse::<RetryMode>().is_err());
    }

    #[test]
    fn adaptive_mode_paces_sends_after_throttling() {
        assert_eq!(" Adaptive ".parse::<RetryMode>().ok(), Some(RetryMode::Adaptive));
        assert!(RetryStrategy::new(RetryPolicy::standard()).rate_limiter().is_none());

        let adaptive = RetryStrategy::new(RetryPolicy::for_mode(RetryMode::Adaptive));
        assert_eq!(adaptive.max_attempts(), 3);
        assert_eq!(adaptive.acquire_send_token(), Duration::ZERO);

        adaptive.observe_attempt(Some(ErrorKind::TransientService));
        assert!(adaptive.rate_limiter().is_some_and(|limiter| !limiter.is_enabled()));

        adaptive.observe_attempt(Some(ErrorKind::Throttling));
        assert!(adaptive.rate_limiter().is_some_and(|limiter| limiter.is_enabled()));
        assert!(adaptive.acquire_send_token() > Duration::ZERO);
    }

    struct RetryInterceptorFailures;

    impl RetryClassifier for RetryInterceptorFailures {
        fn should_retry(&self, context: &RetryPolicyContext) -> bool {
            context.error_kind == ErrorKind::Interceptor
        }
    }

    #[test]
    fn classifier_overrides_default_retryability() {
        let strategy = RetryStrategy::new(
            RetryPolicy::standard().retry_classifier(Arc::new(RetryInterceptorFailures)),
        );
        assert!(matches!(
            strategy.should_retry(&failure(1, ErrorKind::Interceptor)),
            RetryVerdict::Retry { .. }
        ));
        assert_eq!(
            strategy.should_retry(&failure(1, ErrorKind::Throttling)),
            RetryVerdict::Stop(RetryStopReason::NotRetryable)
        );
    }
}

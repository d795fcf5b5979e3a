//! Pipeline metrics: a sink trait, an in-memory counter set and an optional
//! OpenTelemetry exporter.

#[cfg(feature = "otel")]
mod otel;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(feature = "otel")]
pub use otel::OtelMetricsSink;

use crate::error::{Error, ErrorKind};
use crate::util::{duration_millis, lock_unpoisoned};

/// One finished attempt, successful or not.
#[derive(Clone, Debug)]
pub struct AttemptRecord<'a> {
    pub service: &'a str,
    pub operation: &'static str,
    pub attempt: u32,
    pub duration: Duration,
    pub status: Option<u16>,
    pub error: Option<ErrorKind>,
}

/// A retry that was scheduled after attempt `attempt` failed.
#[derive(Clone, Debug)]
pub struct RetryRecord<'a> {
    pub service: &'a str,
    pub operation: &'static str,
    pub attempt: u32,
    pub delay: Duration,
    pub cost: u32,
    pub kind: ErrorKind,
}

#[derive(Clone, Debug)]
pub struct CallRecord<'a> {
    pub service: &'a str,
    pub operation: &'static str,
    pub attempts: u32,
    pub duration: Duration,
    pub error: Option<&'a Error>,
}

impl CallRecord<'_> {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Receives pipeline events. Called inline on the request path, so
/// implementations must return quickly and must not block.
pub trait MetricsSink: Send + Sync {
    fn on_call_start(&self, _service: &str, _operation: &'static str) {}

    fn on_attempt(&self, _record: &AttemptRecord<'_>) {}

    fn on_retry(&self, _record: &RetryRecord<'_>) {}

    fn on_clock_skew_corrected(&self, _service: &str, _offset_ms: i64) {}

    fn on_call_complete(&self, _record: &CallRecord<'_>) {}
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineMetricsSnapshot {
    pub calls_started: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub throttled_attempts: u64,
    pub clock_skew_corrections: u64,
    pub checksum_failures: u64,
    pub transport_errors: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub retry_capacity_available: u32,
    pub retry_capacity: u32,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub attempt_latency_total_ms: u64,
    pub retry_delay_total_ms: u64,
    pub error_counts: BTreeMap<String, u64>,
}

/// Atomic counters behind [`PipelineMetricsSnapshot`]. A disabled instance
/// ignores every event.
#[derive(Clone, Debug, Default)]
pub struct PipelineMetrics {
    inner: Option<Arc<PipelineMetricsInner>>,
}

#[derive(Debug, Default)]
struct PipelineMetricsInner {
    calls_started: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    throttled_attempts: AtomicU64,
    clock_skew_corrections: AtomicU64,
    checksum_failures: AtomicU64,
    transport_errors: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    latency_samples: AtomicU64,
    latency_total_ms: AtomicU64,
    attempt_latency_total_ms: AtomicU64,
    retry_delay_total_ms: AtomicU64,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

impl PipelineMetrics {
    pub fn enabled() -> Self {
        Self {
            inner: Some(Arc::new(PipelineMetricsInner::default())),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        let Some(inner) = &self.inner else {
            return PipelineMetricsSnapshot::default();
        };
        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };
        PipelineMetricsSnapshot {
            calls_started: inner.calls_started.load(Ordering::Relaxed),
            calls_succeeded: inner.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: inner.calls_failed.load(Ordering::Relaxed),
            attempts: inner.attempts.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            throttled_attempts: inner.throttled_attempts.load(Ordering::Relaxed),
            clock_skew_corrections: inner.clock_skew_corrections.load(Ordering::Relaxed),
            checksum_failures: inner.checksum_failures.load(Ordering::Relaxed),
            transport_errors: inner.transport_errors.load(Ordering::Relaxed),
            timeouts: inner.timeouts.load(Ordering::Relaxed),
            cancellations: inner.cancellations.load(Ordering::Relaxed),
            retry_capacity_available: 0,
            retry_capacity: 0,
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            attempt_latency_total_ms: inner.attempt_latency_total_ms.load(Ordering::Relaxed),
            retry_delay_total_ms: inner.retry_delay_total_ms.load(Ordering::Relaxed),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }

    fn add_error_count(inner: &PipelineMetricsInner, error_key: String) {
        let mut error_counts = lock_unpoisoned(&inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }
}

impl MetricsSink for PipelineMetrics {
    fn on_call_start(&self, _service: &str, _operation: &'static str) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.calls_started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_attempt(&self, record: &AttemptRecord<'_>) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.attempts.fetch_add(1, Ordering::Relaxed);
        inner
            .attempt_latency_total_ms
            .fetch_add(duration_millis(record.duration), Ordering::Relaxed);
        match record.error {
            Some(ErrorKind::Throttling) => {
                inner.throttled_attempts.fetch_add(1, Ordering::Relaxed);
            }
            Some(ErrorKind::Transport) => {
                inner.transport_errors.fetch_add(1, Ordering::Relaxed);
            }
            Some(ErrorKind::Timeout) => {
                inner.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn on_retry(&self, record: &RetryRecord<'_>) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.retries.fetch_add(1, Ordering::Relaxed);
        inner
            .retry_delay_total_ms
            .fetch_add(duration_millis(record.delay), Ordering::Relaxed);
    }

    fn on_clock_skew_corrected(&self, _service: &str, _offset_ms: i64) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.clock_skew_corrections.fetch_add(1, Ordering::Relaxed);
    }

    fn on_call_complete(&self, record: &CallRecord<'_>) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner
            .latency_total_ms
            .fetch_add(duration_millis(record.duration), Ordering::Relaxed);
        let Some(error) = record.error else {
            inner.calls_succeeded.fetch_add(1, Ordering::Relaxed);
            return;
        };
        inner.calls_failed.fetch_add(1, Ordering::Relaxed);
        match error.kind() {
            ErrorKind::DataIntegrity => {
                inner.checksum_failures.fetch_add(1, Ordering::Relaxed);
            }
            ErrorKind::CallTimeout => {
                inner.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            ErrorKind::Cancellation => {
                inner.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        let key = match error.service_error() {
            Some(service) => format!("service:{}", service.code),
            None => error.kind().as_str().to_owned(),
        };
        Self::add_error_count(inner, key);
    }
}

/// The client's built-in counters plus any caller-registered sinks.
#[derive(Clone, Default)]
pub(crate) struct MetricsFanout {
    builtin: PipelineMetrics,
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl MetricsFanout {
    pub(crate) fn new(builtin: PipelineMetrics, sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { builtin, sinks }
    }

    pub(crate) fn builtin(&self) -> &PipelineMetrics {
        &self.builtin
    }

    fn each(&self, mut event: impl FnMut(&dyn MetricsSink)) {
        event(&self.builtin);
        for sink in &self.sinks {
            event(sink.as_ref());
        }
    }

    pub(crate) fn call_start(&self, service: &str, operation: &'static str) {
        self.each(|sink| sink.on_call_start(service, operation));
    }

    pub(crate) fn attempt(&self, record: &AttemptRecord<'_>) {
        self.each(|sink| sink.on_attempt(record));
    }

    pub(crate) fn retry(&self, record: &RetryRecord<'_>) {
        self.each(|sink| sink.on_retry(record));
    }

    pub(crate) fn clock_skew_corrected(&self, service: &str, offset_ms: i64) {
        self.each(|sink| sink.on_clock_skew_corrected(service, offset_ms));
    }

    pub(crate) fn call_complete(&self, record: &CallRecord<'_>) {
        self.each(|sink| sink.on_call_complete(record));
    }
}

impl std::fmt::Debug for MetricsFanout {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MetricsFanout")
            .field("builtin", &self.builtin.is_enabled())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::{
        AttemptRecord, CallRecord, MetricsFanout, MetricsSink, PipelineMetrics, RetryRecord,
    };
    use crate::error::{Error, ErrorKind, ServiceError};

    fn attempt(error: Option<ErrorKind>) -> AttemptRecord<'static> {
        AttemptRecord {
            service: "dynamodb",
            operation: "GetItem",
            attempt: 1,
            duration: Duration::from_millis(12),
            status: Some(400),
            error,
        }
    }

    #[test]
    fn disabled_metrics_ignore_events() {
        let metrics = PipelineMetrics::disabled();
        metrics.on_call_start("dynamodb", "GetItem");
        metrics.on_attempt(&attempt(None));
        assert_eq!(metrics.snapshot().calls_started, 0);
    }

    #[test]
    fn snapshot_counts_attempts_retries_and_outcomes() {
        let metrics = PipelineMetrics::enabled();
        metrics.on_call_start("dynamodb", "GetItem");
        metrics.on_attempt(&attempt(Some(ErrorKind::Throttling)));
        metrics.on_retry(&RetryRecord {
            service: "dynamodb",
            operation: "GetItem",
            attempt: 1,
            delay: Duration::from_millis(250),
            cost: 5,
            kind: ErrorKind::Throttling,
        });
        metrics.on_attempt(&attempt(Some(ErrorKind::Throttling)));
        metrics.on_clock_skew_corrected("dynamodb", 600_000);
        let error = Error::Service(ServiceError {
            status: 400,
            code: "ThrottlingException".to_owned(),
            message: None,
            request_id: None,
            kind: ErrorKind::Throttling,
        });
        metrics.on_call_complete(&CallRecord {
            service: "dynamodb",
            operation: "GetItem",
            attempts: 2,
            duration: Duration::from_millis(300),
            error: Some(&error),
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls_started, 1);
        assert_eq!(snapshot.calls_failed, 1);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.throttled_attempts, 2);
        assert_eq!(snapshot.clock_skew_corrections, 1);
        assert_eq!(snapshot.attempt_latency_total_ms, 24);
        assert_eq!(snapshot.retry_delay_total_ms, 250);
        assert_eq!(snapshot.latency_avg_ms, 300.0);
        assert_eq!(snapshot.error_counts.get("service:ThrottlingException"), Some(&1));
    }

    #[derive(Default)]
    struct CountingSink {
        calls: AtomicU32,
    }

    impl MetricsSink for CountingSink {
        fn on_call_complete(&self, _record: &CallRecord<'_>) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn fanout_reaches_builtin_and_custom_sinks() {
        let sink = Arc::new(CountingSink::default());
        let fanout = MetricsFanout::new(PipelineMetrics::enabled(), vec![sink.clone() as Arc<dyn MetricsSink>]);
        fanout.call_complete(&CallRecord {
            service: "s3",
            operation: "GetObject",
            attempts: 1,
            duration: Duration::from_millis(5),
            error: None,
        });
        assert_eq!(sink.calls.load(Ordering::Relaxed), 1);
        assert_eq!(fanout.builtin().snapshot().calls_succeeded, 1);
    }
}

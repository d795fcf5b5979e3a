use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};

use super::{AttemptRecord, CallRecord, MetricsSink, RetryRecord};

/// Exports pipeline events through the global OpenTelemetry meter provider.
pub struct OtelMetricsSink {
    client_name: String,
    calls_started: Counter<u64>,
    calls_succeeded: Counter<u64>,
    calls_failed: Counter<u64>,
    attempts: Counter<u64>,
    retries: Counter<u64>,
    clock_skew_corrections: Counter<u64>,
    call_duration_ms: Histogram<f64>,
    attempt_duration_ms: Histogram<f64>,
}

impl OtelMetricsSink {
    pub fn new(client_name: impl Into<String>) -> Self {
        let meter = global::meter("sdkx");
        Self {
            client_name: client_name.into(),
            calls_started: meter
                .u64_counter("sdkx.call.started")
                .with_description("Total started operation calls")
                .build(),
            calls_succeeded: meter
                .u64_counter("sdkx.call.succeeded")
                .with_description("Total successful operation calls")
                .build(),
            calls_failed: meter
                .u64_counter("sdkx.call.failed")
                .with_description("Total failed operation calls")
                .build(),
            attempts: meter
                .u64_counter("sdkx.attempt.count")
                .with_description("Total HTTP attempts")
                .build(),
            retries: meter
                .u64_counter("sdkx.call.retries")
                .with_description("Total scheduled retries")
                .build(),
            clock_skew_corrections: meter
                .u64_counter("sdkx.clock_skew.corrections")
                .with_description("Total clock skew corrections")
                .build(),
            call_duration_ms: meter
                .f64_histogram("sdkx.call.duration.ms")
                .with_unit("ms")
                .with_description("End-to-end call latency in milliseconds")
                .build(),
            attempt_duration_ms: meter
                .f64_histogram("sdkx.attempt.duration.ms")
                .with_unit("ms")
                .with_description("Single attempt latency in milliseconds")
                .build(),
        }
    }

    fn operation_attributes(&self, service: &str, operation: &'static str) -> [KeyValue; 3] {
        [
            KeyValue::new("sdkx.client", self.client_name.clone()),
            KeyValue::new("rpc.service", service.to_owned()),
            KeyValue::new("rpc.method", operation),
        ]
    }
}

impl std::fmt::Debug for OtelMetricsSink {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("OtelMetricsSink")
            .field("client_name", &self.client_name)
            .finish_non_exhaustive()
    }
}

impl MetricsSink for OtelMetricsSink {
    fn on_call_start(&self, service: &str, operation: &'static str) {
        self.calls_started
            .add(1, &self.operation_attributes(service, operation));
    }

    fn on_attempt(&self, record: &AttemptRecord<'_>) {
        let attributes = self.operation_attributes(record.service, record.operation);
        self.attempts.add(1, &attributes);
        self.attempt_duration_ms
            .record(record.duration.as_secs_f64() * 1000.0, &attributes);
    }

    fn on_retry(&self, record: &RetryRecord<'_>) {
        let [client, service, method] = self.operation_attributes(record.service, record.operation);
        self.retries.add(
            1,
            &[
                client,
                service,
                method,
                KeyValue::new("error.type", record.kind.as_str()),
            ],
        );
    }

    fn on_clock_skew_corrected(&self, service: &str, _offset_ms: i64) {
        self.clock_skew_corrections.add(
            1,
            &[
                KeyValue::new("sdkx.client", self.client_name.clone()),
                KeyValue::new("rpc.service", service.to_owned()),
            ],
        );
    }

    fn on_call_complete(&self, record: &CallRecord<'_>) {
        let attributes = self.operation_attributes(record.service, record.operation);
        self.call_duration_ms
            .record(record.duration.as_secs_f64() * 1000.0, &attributes);
        match record.error {
            None => self.calls_succeeded.add(1, &attributes),
            Some(error) => {
                let [client, service, method] = attributes;
                self.calls_failed.add(
                    1,
                    &[
                        client,
                        service,
                        method,
                        KeyValue::new("error.type", error.code().as_str()),
                    ],
                );
            }
        }
    }
}

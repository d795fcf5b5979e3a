//! Blocking client. Runs the same stages as [`crate::Client`] on the calling
//! thread; cancellation is observed between stages and while backing off.

mod builder;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Uri;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span};

pub use builder::BlockingClientBuilder;

use crate::checksum::ValidatingReader;
use crate::client::{CallOptions, Delivered, Delivery, Received, streamed_head};
use crate::context::{ExecutionContext, Phase};
use crate::error::Error;
use crate::identity::BlockingIdentityResolver;
use crate::message::{HttpResponse, ReaderBody, StreamingOutput};
use crate::metrics::PipelineMetricsSnapshot;
use crate::operation::Operation;
use crate::orchestrator::{CallPlan, PipelineCore};
use crate::retry::{RetryTokenBucket, RetryVerdict};
use crate::skew::ClockSkew;
use crate::transport::{BlockingHttpTransport, collect_reader};
use crate::util::redact_uri;

const SLEEP_SLICE: Duration = Duration::from_millis(5);

#[derive(Clone, Copy)]
struct CallLimits<'a> {
    cancellation: Option<&'a CancellationToken>,
    call_timeout: Option<Duration>,
    deadline: Option<Instant>,
    attempt_timeout: Duration,
}

impl CallLimits<'_> {
    fn cancelled(&self) -> bool {
        self.cancellation.is_some_and(CancellationToken::is_cancelled)
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fails fast when the call was cancelled or ran out of time.
    fn check(&self, attempts: u32) -> crate::Result<()> {
        if self.cancelled() {
            return Err(Error::Cancelled { attempts });
        }
        if let (Some(timeout), Some(remaining)) = (self.call_timeout, self.remaining())
            && remaining.is_zero()
        {
            return Err(Error::CallTimeout {
                timeout_ms: timeout.as_millis(),
                attempts,
            });
        }
        Ok(())
    }

    /// Transport timeout for the next attempt, bounded by the call deadline.
    fn transmit_timeout(&self) -> Duration {
        match self.remaining() {
            Some(remaining) => self.attempt_timeout.min(remaining),
            None => self.attempt_timeout,
        }
    }

    /// Sleeps in short slices so cancellation and the deadline stay responsive.
    fn sleep(&self, delay: Duration, attempts: u32) -> crate::Result<()> {
        let wake_at = Instant::now() + delay;
        loop {
            self.check(attempts)?;
            let now = Instant::now();
            if now >= wake_at {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(wake_at - now));
        }
    }
}

#[derive(Clone)]
pub struct BlockingClient {
    core: Arc<PipelineCore>,
    transport: Arc<dyn BlockingHttpTransport>,
    identity: Arc<dyn BlockingIdentityResolver>,
}

impl BlockingClient {
    pub fn builder(service: impl Into<String>) -> BlockingClientBuilder {
        BlockingClientBuilder::new(service)
    }

    pub fn call<O: Operation>(&self, operation: &O, input: O::Input) -> crate::Result<O::Output> {
        self.call_with(operation, input, CallOptions::default())
    }

    pub fn call_with<O: Operation>(
        &self,
        operation: &O,
        input: O::Input,
        options: CallOptions,
    ) -> crate::Result<O::Output> {
        let span = info_span!(
            "sdkx.call",
            service = %self.core.service,
            operation = operation.name()
        );
        let _entered = span.enter();
        self.execute(operation, input, &options, Delivery::Buffered)
            .map(|delivered| delivered.output)
    }

    /// Like [`call`](Self::call), but hands back a successful response body
    /// unread. A checksum mismatch surfaces from the reader at end of body as
    /// an `InvalidData` I/O error wrapping [`Error::ChecksumMismatch`].
    pub fn call_streaming<O: Operation>(
        &self,
        operation: &O,
        input: O::Input,
    ) -> crate::Result<StreamingOutput<O::Output, ReaderBody>> {
        self.call_streaming_with(operation, input, CallOptions::default())
    }

    pub fn call_streaming_with<O: Operation>(
        &self,
        operation: &O,
        input: O::Input,
        options: CallOptions,
    ) -> crate::Result<StreamingOutput<O::Output, ReaderBody>> {
        let span = info_span!(
            "sdkx.call",
            service = %self.core.service,
            operation = operation.name(),
            streaming = true
        );
        let _entered = span.enter();
        self.execute(operation, input, &options, Delivery::Streaming)?
            .into_streaming_output()
    }

    fn execute<O: Operation>(
        &self,
        operation: &O,
        input: O::Input,
        options: &CallOptions,
        delivery: Delivery,
    ) -> crate::Result<Delivered<O::Output, ReaderBody>> {
        let mut context = self.core.new_context(operation, input);
        let call_timeout = options.configured_call_timeout().or(self.core.call_timeout);
        let limits = CallLimits {
            cancellation: options.configured_cancellation(),
            call_timeout,
            deadline: call_timeout.map(|timeout| Instant::now() + timeout),
            attempt_timeout: options
                .configured_attempt_timeout()
                .unwrap_or(self.core.attempt_timeout),
        };
        let result = self.drive(operation, &mut context, limits, delivery);
        if let Err(error) = &result {
            self.core.on_failure(&mut context, error);
        }
        result
    }

    pub fn presign<O: Operation>(
        &self,
        operation: &O,
        input: O::Input,
        expires_in: Duration,
    ) -> crate::Result<Uri> {
        let core = &self.core;
        let mut context = ExecutionContext::new(&core.service, operation.name(), 1, input);
        let plan = core.prepare(operation, &mut context)?;
        let request = core.next_request(&mut context)?;
        let identity = self.identity.resolve(context.attributes())?;
        core.presign(&plan, &request, &identity, expires_in)
    }

    pub fn metrics_snapshot(&self) -> PipelineMetricsSnapshot {
        self.core.metrics_snapshot()
    }

    pub fn clock_skew(&self) -> &ClockSkew {
        &self.core.skew
    }

    pub fn retry_token_bucket(&self) -> &Arc<RetryTokenBucket> {
        self.core.retry.bucket()
    }

    pub fn interceptor_names(&self) -> Vec<&'static str> {
        self.core.interceptors.names()
    }

    fn drive<O: Operation>(
        &self,
        operation: &O,
        context: &mut ExecutionContext,
        limits: CallLimits<'_>,
        delivery: Delivery,
    ) -> crate::Result<Delivered<O::Output, ReaderBody>> {
        let core = &self.core;
        limits.check(0)?;
        let plan = core.prepare(operation, context)?;
        let method = context
            .template
            .as_ref()
            .map(|request| request.method().clone())
            .unwrap_or_default();

        let mut last_acquired = 0;
        loop {
            limits.check(context.attempt())?;
            context.transition(Phase::Signing);
            let attempt = context.begin_attempt();
            let span = info_span!("sdkx.attempt", attempt, max_attempts = context.max_attempts());
            let result = span.in_scope(|| self.attempt(operation, &plan, context, limits, delivery));
            let duration = context.end_attempt();

            let error = match result {
                Ok(delivered) => {
                    core.record_attempt(context, duration, None);
                    core.on_success(context, last_acquired);
                    return Ok(delivered);
                }
                Err(error) => error,
            };
            core.record_attempt(context, duration, Some(&error));
            if PipelineCore::invalidates_identity(&error) {
                debug!(resolver = self.identity.name(), "invalidating cached identity");
                self.identity.invalidate();
            }

            match core.decide(context, &error, &method, limits.remaining()) {
                RetryVerdict::Retry { delay, cost } => {
                    last_acquired = cost;
                    let delay = core.schedule_retry(context, &error, delay, cost);
                    limits.sleep(delay, context.attempt())?;
                }
                RetryVerdict::Stop(reason) => {
                    return Err(core.finish_failure(context, error, reason));
                }
            }
        }
    }

    fn attempt<O: Operation>(
        &self,
        operation: &O,
        plan: &CallPlan,
        context: &mut ExecutionContext,
        limits: CallLimits<'_>,
        delivery: Delivery,
    ) -> crate::Result<Delivered<O::Output, ReaderBody>> {
        let core = &self.core;
        let attempts = context.attempt();
        let mut request = core.next_request(context)?;
        let pacing = core.send_delay();
        if !pacing.is_zero() {
            limits.sleep(pacing, attempts)?;
        }

        let identity = self.identity.resolve(context.attributes())?;
        limits.check(attempts)?;
        core.sign(plan, &mut request, &identity)?;
        let request = core.before_transmission(context, request)?;
        limits.check(attempts)?;

        let method = request.method().clone();
        let uri = request.uri().clone();
        let timeout = limits.transmit_timeout();
        debug!(method = %method, uri = %redact_uri(&uri), "sending request");
        let sent = match delivery {
            Delivery::Buffered => self
                .transport
                .send(request, Some(timeout))
                .map(Received::Buffered),
            Delivery::Streaming => self
                .transport
                .send_streaming(request, Some(timeout))
                .and_then(|response| {
                    if response.status().is_success() {
                        return Ok(Received::Streaming(response));
                    }
                    let (status, headers, body) = response.into_parts();
                    let body = collect_reader(body, core.max_response_body_bytes)?;
                    Ok(Received::Buffered(HttpResponse::new(status, headers, body)))
                }),
        };
        // A cancellation that arrived mid-flight wins over whatever came back.
        limits.check(attempts)?;
        let received = sent.map_err(|error| {
            if error.kind() == crate::error::TransportErrorKind::Timeout {
                PipelineCore::attempt_timeout_error(timeout, &method, &uri)
            } else {
                PipelineCore::transport_error(&method, &uri, error)
            }
        })?;

        let streaming = match received {
            Received::Buffered(response) => {
                let replay = (delivery == Delivery::Streaming).then(|| {
                    let body = ReaderBody::from_bytes(response.body().clone());
                    (response.status(), response.headers().clone(), body)
                });
                let output = core.handle_response(operation, plan, context, response)?;
                return Ok(Delivered {
                    output,
                    stream: replay,
                });
            }
            Received::Streaming(streaming) => streaming,
        };
        let (status, headers, body) = streaming.into_parts();
        let head = HttpResponse::new(status, headers, Bytes::new());
        let (output, pending) = core.handle_streaming_head(operation, plan, context, head)?;
        let (status, headers) = streamed_head(context);
        let body = match pending {
            Some((algorithm, expected)) => {
                let length = body.content_length();
                let validated = ReaderBody::new(ValidatingReader::new(body, algorithm, expected));
                match length {
                    Some(length) => validated.with_content_length(length),
                    None => validated,
                }
            }
            None => body,
        };
        Ok(Delivered {
            output,
            stream: Some((status, headers, body)),
        })
    }
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BlockingClient")
            .field("service", &self.core.service)
            .field("endpoint", &self.core.endpoint)
            .field("identity", &self.identity.name())
            .field("interceptors", &self.core.interceptors)
            .finish_non_exhaustive()
    }
}

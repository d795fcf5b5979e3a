//! Async client. Every await point of a call is raced against the caller's
//! cancellation token and the call deadline.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use crate::checksum::{ChecksumCalculation, ChecksumValidation, ValidatingBody};
use crate::classify::ResponseClassifier;
use crate::config::{ClientConfig, ClientProfile};
use crate::context::{ExecutionContext, Phase};
use crate::error::Error;
use crate::identity::{
    Credentials, EnvironmentIdentityResolver, IdentityResolver, StaticIdentityResolver,
};
use crate::interceptor::Interceptor;
use crate::message::{ByteStream, HttpResponse, StreamingHttpResponse, StreamingOutput};
use crate::metrics::{MetricsSink, PipelineMetricsSnapshot};
use crate::operation::Operation;
use crate::orchestrator::{CallPlan, CoreBuilder, PipelineCore};
use crate::retry::{RetryPolicy, RetryTokenBucket, RetryVerdict};
use crate::skew::{Clock, ClockSkew};
use crate::transport::{HttpTransport, TransportError, collect_stream};
use crate::util::redact_uri;

/// Per-call overrides of the client's timeouts, plus cancellation.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    cancellation: Option<CancellationToken>,
    call_timeout: Option<Duration>,
    attempt_timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = Some(call_timeout);
        self
    }

    pub fn attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = Some(attempt_timeout);
        self
    }

    pub(crate) fn configured_cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub(crate) fn configured_call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    pub(crate) fn configured_attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }
}

#[derive(Clone, Copy, Debug)]
struct CallDeadline {
    timeout: Duration,
    at: Instant,
}

impl CallDeadline {
    fn start(timeout: Option<Duration>) -> Option<Self> {
        timeout.map(|timeout| Self {
            timeout,
            at: Instant::now() + timeout,
        })
    }

    fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

async fn deadline_expired(deadline: Option<CallDeadline>) -> Duration {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(deadline.at).await;
            deadline.timeout
        }
        None => future::pending().await,
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => future::pending().await,
    }
}

fn is_cancelled(token: Option<&CancellationToken>) -> bool {
    token.is_some_and(CancellationToken::is_cancelled)
}

/// Per-call limits resolved from [`CallOptions`] and the client defaults.
#[derive(Clone, Copy)]
struct CallLimits<'a> {
    cancellation: Option<&'a CancellationToken>,
    deadline: Option<CallDeadline>,
    attempt_timeout: Duration,
}

/// How an attempt hands back the response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Buffered,
    /// Successful bodies stay on the wire; error bodies are still buffered
    /// so they can be classified and retried.
    Streaming,
}

/// Output of a successful attempt; `stream` is only set for streaming delivery.
pub(crate) struct Delivered<T, B> {
    pub(crate) output: T,
    pub(crate) stream: Option<(StatusCode, HeaderMap, B)>,
}

impl<T, B> Delivered<T, B> {
    pub(crate) fn into_streaming_output(self) -> crate::Result<StreamingOutput<T, B>> {
        let (status, headers, body) = self
            .stream
            .ok_or_else(|| Error::configuration("streaming call completed without a body"))?;
        Ok(StreamingOutput::new(self.output, status, headers, body))
    }
}

/// What came back from the transport: buffered, or a successful head with
/// the body still unread.
pub(crate) enum Received<B> {
    Buffered(HttpResponse),
    Streaming(StreamingHttpResponse<B>),
}

#[derive(Clone)]
pub struct Client {
    core: Arc<PipelineCore>,
    transport: Arc<dyn HttpTransport>,
    identity: Arc<dyn IdentityResolver>,
}

impl Client {
    pub fn builder(service: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(service)
    }

    pub async fn call<O: Operation>(&self, operation: &O, input: O::Input) -> crate::Result<O::Output> {
        self.call_with(operation, input, CallOptions::default()).await
    }

    pub async fn call_with<O: Operation>(
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
        self.execute(operation, input, &options, Delivery::Buffered)
            .instrument(span)
            .await
            .map(|delivered| delivered.output)
    }

    /// Like [`call`](Self::call), but hands back a successful response body
    /// unread. When the operation validates response checksums, a mismatch is
    /// yielded as the stream's last item (an [`Error::ChecksumMismatch`]).
    /// Failures while reading the body are not retried.
    pub async fn call_streaming<O: Operation>(
        &self,
        operation: &O,
        input: O::Input,
    ) -> crate::Result<StreamingOutput<O::Output, ByteStream>> {
        self.call_streaming_with(operation, input, CallOptions::default()).await
    }

    pub async fn call_streaming_with<O: Operation>(
        &self,
        operation: &O,
        input: O::Input,
        options: CallOptions,
    ) -> crate::Result<StreamingOutput<O::Output, ByteStream>> {
        let span = info_span!(
            "sdkx.call",
            service = %self.core.service,
            operation = operation.name(),
            streaming = true
        );
        self.execute(operation, input, &options, Delivery::Streaming)
            .instrument(span)
            .await?
            .into_streaming_output()
    }

    /// Runs the marshalling stages and returns a query-signed URL instead of
    /// sending the request.
    pub async fn presign<O: Operation>(
        &self,
        operation: &O,
        input: O::Input,
        expires_in: Duration,
    ) -> crate::Result<Uri> {
        let core = &self.core;
        let mut context = ExecutionContext::new(&core.service, operation.name(), 1, input);
        let plan = core.prepare(operation, &mut context)?;
        let request = core.next_request(&mut context)?;
        let identity = self.identity.resolve(context.attributes()).await?;
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

    async fn execute<O: Operation>(
        &self,
        operation: &O,
        input: O::Input,
        options: &CallOptions,
        delivery: Delivery,
    ) -> crate::Result<Delivered<O::Output, ByteStream>> {
        let mut context = self.core.new_context(operation, input);
        let limits = CallLimits {
            cancellation: options.configured_cancellation(),
            deadline: CallDeadline::start(
                options.configured_call_timeout().or(self.core.call_timeout),
            ),
            attempt_timeout: options
                .configured_attempt_timeout()
                .unwrap_or(self.core.attempt_timeout),
        };
        let result = self.drive(operation, &mut context, limits, delivery).await;
        if let Err(error) = &result {
            self.core.on_failure(&mut context, error);
        }
        result
    }

    async fn drive<O: Operation>(
        &self,
        operation: &O,
        context: &mut ExecutionContext,
        limits: CallLimits<'_>,
        delivery: Delivery,
    ) -> crate::Result<Delivered<O::Output, ByteStream>> {
        let core = &self.core;
        if is_cancelled(limits.cancellation) {
            return Err(Error::Cancelled { attempts: 0 });
        }
        let plan = core.prepare(operation, context)?;
        let method = context
            .template
            .as_ref()
            .map(|request| request.method().clone())
            .unwrap_or_default();

        let mut last_acquired = 0;
        loop {
            if is_cancelled(limits.cancellation) {
                return Err(Error::Cancelled {
                    attempts: context.attempt(),
                });
            }
            if let Some(deadline) = limits.deadline
                && deadline.remaining().is_zero()
            {
                return Err(core.call_timeout_error(deadline.timeout, context));
            }

            context.transition(Phase::Signing);
            let attempt = context.begin_attempt();
            let span = info_span!("sdkx.attempt", attempt, max_attempts = context.max_attempts());
            let result = self
                .attempt(operation, &plan, context, limits, delivery)
                .instrument(span)
                .await;
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

            let remaining = limits.deadline.map(|deadline| deadline.remaining());
            match core.decide(context, &error, &method, remaining) {
                RetryVerdict::Retry { delay, cost } => {
                    last_acquired = cost;
                    let delay = core.schedule_retry(context, &error, delay, cost);
                    let attempts = context.attempt();
                    tokio::select! {
                        biased;
                        () = cancelled(limits.cancellation) => {
                            return Err(Error::Cancelled { attempts });
                        }
                        timeout = deadline_expired(limits.deadline) => {
                            return Err(core.call_timeout_error(timeout, context));
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryVerdict::Stop(reason) => {
                    return Err(core.finish_failure(context, error, reason));
                }
            }
        }
    }

    async fn attempt<O: Operation>(
        &self,
        operation: &O,
        plan: &CallPlan,
        context: &mut ExecutionContext,
        limits: CallLimits<'_>,
        delivery: Delivery,
    ) -> crate::Result<Delivered<O::Output, ByteStream>> {
        let core = &self.core;
        let attempts = context.attempt();
        let mut request = core.next_request(context)?;
        let pacing = core.send_delay();
        if !pacing.is_zero() {
            tokio::select! {
                biased;
                () = cancelled(limits.cancellation) => return Err(Error::Cancelled { attempts }),
                timeout = deadline_expired(limits.deadline) => {
                    return Err(Error::CallTimeout { timeout_ms: timeout.as_millis(), attempts });
                }
                () = tokio::time::sleep(pacing) => {}
            }
        }

        let identity = tokio::select! {
            biased;
            () = cancelled(limits.cancellation) => return Err(Error::Cancelled { attempts }),
            timeout = deadline_expired(limits.deadline) => {
                return Err(Error::CallTimeout { timeout_ms: timeout.as_millis(), attempts });
            }
            identity = self.identity.resolve(context.attributes()) => identity?,
        };
        core.sign(plan, &mut request, &identity)?;
        let request = core.before_transmission(context, request)?;

        let method: Method = request.method().clone();
        let uri = request.uri().clone();
        debug!(method = %method, uri = %redact_uri(&uri), "sending request");
        let attempt_timeout = limits.attempt_timeout;
        let exchange = async {
            if delivery == Delivery::Buffered {
                return self.transport.send(request).await.map(Received::Buffered);
            }
            let response = self.transport.send_streaming(request).await?;
            if response.status().is_success() {
                return Ok(Received::Streaming(response));
            }
            let (status, headers, body) = response.into_parts();
            let body = collect_stream(body, core.max_response_body_bytes).await?;
            Ok::<_, TransportError>(Received::Buffered(HttpResponse::new(status, headers, body)))
        };
        let received = tokio::select! {
            biased;
            () = cancelled(limits.cancellation) => return Err(Error::Cancelled { attempts }),
            timeout = deadline_expired(limits.deadline) => {
                return Err(Error::CallTimeout { timeout_ms: timeout.as_millis(), attempts });
            }
            sent = tokio::time::timeout(attempt_timeout, exchange) => match sent {
                Ok(Ok(received)) => received,
                Ok(Err(error)) => return Err(PipelineCore::transport_error(&method, &uri, error)),
                Err(_) => {
                    return Err(PipelineCore::attempt_timeout_error(attempt_timeout, &method, &uri));
                }
            },
        };

        match received {
            Received::Buffered(response) => {
                let replay = (delivery == Delivery::Streaming).then(|| {
                    let body = ByteStream::from_bytes(response.body().clone());
                    (response.status(), response.headers().clone(), body)
                });
                let output = core.handle_response(operation, plan, context, response)?;
                Ok(Delivered {
                    output,
                    stream: replay,
                })
            }
            Received::Streaming(response) => {
                let (status, headers, body) = response.into_parts();
                let head = HttpResponse::new(status, headers, Bytes::new());
                let (output, pending) = core.handle_streaming_head(operation, plan, context, head)?;
                let (status, headers) = streamed_head(context);
                let body = match pending {
                    Some((algorithm, expected)) => {
                        let length = body.content_length();
                        let validated = ByteStream::new(ValidatingBody::new(body, algorithm, expected));
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
    }
}

/// Status and headers of the response head as the interceptors left them.
pub(crate) fn streamed_head(context: &ExecutionContext) -> (StatusCode, HeaderMap) {
    context
        .response()
        .map(|response| (response.status(), response.headers().clone()))
        .unwrap_or_default()
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("service", &self.core.service)
            .field("endpoint", &self.core.endpoint)
            .field("identity", &self.identity.name())
            .field("interceptors", &self.core.interceptors)
            .finish_non_exhaustive()
    }
}

pub struct ClientBuilder {
    core: CoreBuilder,
    transport: Option<Arc<dyn HttpTransport>>,
    identity: Option<Arc<dyn IdentityResolver>>,
}

impl ClientBuilder {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            core: CoreBuilder::new(service),
            transport: None,
            identity: None,
        }
    }

    /// Replaces every plain setting at once; collaborators are kept.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.core.config = config;
        self
    }

    /// Applies the `AWS_*` environment overrides to the current settings.
    pub fn with_env(mut self) -> crate::Result<Self> {
        self.core.config = self
            .core
            .config
            .apply_env_from(|name| std::env::var(name).ok())?;
        Ok(self)
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.core.config.region = Some(region.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.core.config.endpoint = Some(endpoint.into());
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.core.config.retry_policy = retry_policy;
        self
    }

    /// Shares a retry budget with other clients.
    pub fn retry_token_bucket(mut self, bucket: Arc<RetryTokenBucket>) -> Self {
        self.core.bucket = Some(bucket);
        self
    }

    pub fn attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.core.config.attempt_timeout = attempt_timeout;
        self
    }

    pub fn call_timeout(mut self, call_timeout: Duration) -> Self {
        self.core.config.call_timeout = Some(call_timeout);
        self
    }

    pub fn checksum_calculation(mut self, checksum_calculation: ChecksumCalculation) -> Self {
        self.core.config.checksum_calculation = checksum_calculation;
        self
    }

    pub fn checksum_validation(mut self, checksum_validation: ChecksumValidation) -> Self {
        self.core.config.checksum_validation = checksum_validation;
        self
    }

    pub fn double_uri_encode(mut self, enabled: bool) -> Self {
        self.core.config.double_uri_encode = enabled;
        self
    }

    pub fn content_sha256_header(mut self, enabled: bool) -> Self {
        self.core.config.content_sha256_header = enabled;
        self
    }

    pub fn unsigned_payload(mut self, enabled: bool) -> Self {
        self.core.config.unsigned_payload = enabled;
        self
    }

    /// Caps buffered response bodies of the default transport.
    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.core.config.max_response_body_bytes = max_response_body_bytes;
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.core.config.client_name = client_name.into();
        self
    }

    pub fn profile(mut self, profile: ClientProfile) -> Self {
        self.core.config = self.core.config.apply_profile(profile);
        self
    }

    pub fn transport_arc(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: HttpTransport + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    pub fn identity_resolver_arc(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn identity_resolver<R>(self, identity: R) -> Self
    where
        R: IdentityResolver + 'static,
    {
        self.identity_resolver_arc(Arc::new(identity))
    }

    pub fn credentials(self, credentials: Credentials) -> Self {
        self.identity_resolver(StaticIdentityResolver::new(credentials))
    }

    pub fn interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.core.interceptors.push(interceptor);
        self
    }

    pub fn interceptor<I>(self, interceptor: I) -> Self
    where
        I: Interceptor + 'static,
    {
        self.interceptor_arc(Arc::new(interceptor))
    }

    pub fn response_classifier_arc(mut self, classifier: Arc<dyn ResponseClassifier>) -> Self {
        self.core.classifier = Some(classifier);
        self
    }

    pub fn response_classifier<C>(self, classifier: C) -> Self
    where
        C: ResponseClassifier + 'static,
    {
        self.response_classifier_arc(Arc::new(classifier))
    }

    pub fn clock_arc(mut self, clock: Arc<dyn Clock>) -> Self {
        self.core.clock = clock;
        self
    }

    pub fn clock<C>(self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock_arc(Arc::new(clock))
    }

    /// Shares skew correction with other clients talking to the same service.
    pub fn clock_skew(mut self, skew: Arc<ClockSkew>) -> Self {
        self.core.skew = Some(skew);
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.core.metrics_enabled = enabled;
        self
    }

    pub fn metrics_sink_arc(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.core.sinks.push(sink);
        self
    }

    pub fn metrics_sink<S>(self, sink: S) -> Self
    where
        S: MetricsSink + 'static,
    {
        self.metrics_sink_arc(Arc::new(sink))
    }

    #[cfg(feature = "otel")]
    pub fn otel_enabled(mut self, enabled: bool) -> Self {
        self.core.otel_enabled = enabled;
        self
    }

    pub fn build(self) -> crate::Result<Client> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(self.core.config.max_response_body_bytes)?,
        };
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(EnvironmentIdentityResolver::new()));
        let core = self.core.build()?;
        Ok(Client {
            core: Arc::new(core),
            transport,
            identity,
        })
    }
}

#[cfg(feature = "hyper-client")]
fn default_transport(max_response_body_bytes: usize) -> crate::Result<Arc<dyn HttpTransport>> {
    Ok(Arc::new(
        crate::transport::HyperTransport::new().max_response_body_bytes(max_response_body_bytes),
    ))
}

#[cfg(not(feature = "hyper-client"))]
fn default_transport(_max_response_body_bytes: usize) -> crate::Result<Arc<dyn HttpTransport>> {
    Err(Error::configuration(
        "no transport configured and the `hyper-client` feature is disabled",
    ))
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientBuilder")
            .field("config", &self.core.config)
            .field("has_transport", &self.transport.is_some())
            .field("has_identity_resolver", &self.identity.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CallDeadline, Client, is_cancelled};
    use crate::error::ErrorCode;
    use crate::identity::Credentials;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn build_requires_a_region() {
        let error = Client::builder("s3")
            .credentials(Credentials::new("AKID", "secret"))
            .build()
            .expect_err("region missing");
        assert_eq!(error.code(), ErrorCode::Configuration);
    }

    #[test]
    fn build_rejects_invalid_endpoints() {
        let error = Client::builder("s3")
            .region("us-east-1")
            .endpoint("not a url")
            .credentials(Credentials::new("AKID", "secret"))
            .build()
            .expect_err("bad endpoint");
        assert_eq!(error.code(), ErrorCode::Configuration);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_remaining_counts_down() {
        let deadline = CallDeadline::start(Some(Duration::from_secs(2))).expect("deadline set");
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(deadline.remaining(), Duration::from_millis(1500));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(deadline.remaining().is_zero());
        assert!(CallDeadline::start(None).is_none());
    }

    #[test]
    fn cancellation_check_tolerates_a_missing_token() {
        let token = CancellationToken::new();
        assert!(!is_cancelled(None));
        assert!(!is_cancelled(Some(&token)));
        token.cancel();
        assert!(is_cancelled(Some(&token)));
    }
}

//! Stages of a call that do not depend on the execution model. The async and
//! blocking clients drive the same [`PipelineCore`] and differ only in how
//! they resolve identities, transmit and sleep.

use std::sync::Arc;
use std::time::Duration;

use http::{HeaderName, HeaderValue, Method, Uri};
use tracing::{debug, warn};

use crate::checksum::{
    self, ChecksumAlgorithm, ChecksumCalculation, ChecksumSpec, ChecksumValidation,
};
use crate::classify::{Classification, JsonErrorClassifier, ResponseClassifier, request_id_header};
use crate::config::ClientConfig;
use crate::context::{ExecutionContext, Phase};
use crate::error::{AttemptHistory, Error, ErrorKind, RetryStopReason, ServiceError};
use crate::identity::SigningIdentity;
use crate::interceptor::{InterceptorChain, InterceptorStage};
use crate::message::{HttpRequest, HttpResponse, SdkBody};
use crate::metrics::{
    AttemptRecord, CallRecord, MetricsFanout, MetricsSink, PipelineMetrics, PipelineMetricsSnapshot,
    RetryRecord,
};
use crate::operation::Operation;
use crate::retry::classification::{is_expired_credential, service_error_kind};
use crate::retry::{RetryPolicyContext, RetryStrategy, RetryTokenBucket, RetryVerdict};
use crate::signer::{SigV4Signer, SigningParams};
use crate::skew::{Clock, ClockSkew, SystemClock};
use crate::transport::TransportError;
use crate::util::{duration_millis, parse_retry_after, redact_uri, validate_endpoint};

/// Per-call decisions made once, before the first attempt.
pub(crate) struct CallPlan {
    pub(crate) signing: SigningParams,
    pub(crate) checksum: Option<ChecksumSpec>,
    pub(crate) classifier: Arc<dyn ResponseClassifier>,
}

/// Shared, call-independent state of a client.
pub(crate) struct PipelineCore {
    pub(crate) service: String,
    pub(crate) endpoint: Option<Uri>,
    pub(crate) signing: SigningParams,
    pub(crate) signer: SigV4Signer,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) skew: Arc<ClockSkew>,
    pub(crate) retry: RetryStrategy,
    pub(crate) interceptors: InterceptorChain,
    pub(crate) classifier: Arc<dyn ResponseClassifier>,
    pub(crate) metrics: MetricsFanout,
    pub(crate) checksum_calculation: ChecksumCalculation,
    pub(crate) checksum_validation: ChecksumValidation,
    pub(crate) attempt_timeout: Duration,
    pub(crate) call_timeout: Option<Duration>,
    /// Cap for error bodies buffered out of a streaming response.
    pub(crate) max_response_body_bytes: usize,
}

impl PipelineCore {
    pub(crate) fn new_context<O: Operation>(&self, operation: &O, input: O::Input) -> ExecutionContext {
        self.metrics.call_start(&self.service, operation.name());
        ExecutionContext::new(&self.service, operation.name(), self.retry.max_attempts(), input)
    }

    /// Runs the once-per-call stages up to and including checksum
    /// calculation and stores the resulting request template on `context`.
    pub(crate) fn prepare<O: Operation>(
        &self,
        operation: &O,
        context: &mut ExecutionContext,
    ) -> Result<CallPlan, Error> {
        self.interceptors.run(InterceptorStage::BeforeExecution, context)?;
        self.interceptors.run(InterceptorStage::ModifyInput, context)?;
        self.interceptors.run(InterceptorStage::BeforeMarshalling, context)?;

        let input = context.input::<O::Input>().ok_or_else(|| {
            Error::configuration(format!(
                "input of {} was replaced with a value of another type",
                operation.name()
            ))
        })?;
        let endpoint = operation
            .endpoint(input)
            .or_else(|| self.endpoint.clone())
            .ok_or_else(|| Error::configuration("no endpoint configured"))?;
        let request = operation
            .marshal(input, &endpoint)
            .map_err(|source| Error::Marshal {
                operation: operation.name(),
                source,
            })?;
        context.set_request(request);

        self.interceptors.run(InterceptorStage::AfterMarshalling, context)?;
        self.interceptors.run(InterceptorStage::ModifyHttpRequest, context)?;

        let mut request = context
            .take_request()
            .ok_or_else(|| Error::configuration("request removed by an interceptor"))?;
        request.ensure_content_length();

        let mut signing = operation.signing_params(self.signing.clone());
        let checksum = operation.checksum_spec();
        if let Some(algorithm) = checksum
            .as_ref()
            .and_then(|spec| spec.request_checksum(self.checksum_calculation))
        {
            attach_request_checksum(&mut request, algorithm, &mut signing, operation.name())?;
        }
        context.template = Some(request);

        Ok(CallPlan {
            signing,
            checksum,
            classifier: operation
                .classifier()
                .unwrap_or_else(|| Arc::clone(&self.classifier)),
        })
    }

    /// A fresh copy of the request template for the next attempt. A streaming
    /// template is handed out once.
    pub(crate) fn next_request(&self, context: &mut ExecutionContext) -> Result<HttpRequest, Error> {
        if let Some(request) = context.template.as_ref().and_then(HttpRequest::try_clone) {
            return Ok(request);
        }
        context
            .template
            .take()
            .ok_or(Error::Signing {
                source: crate::signer::SigningError::BodyConsumed,
            })
    }

    pub(crate) fn body_replayable(context: &ExecutionContext) -> bool {
        context
            .template
            .as_ref()
            .is_some_and(|template| template.body().is_replayable())
    }

    pub(crate) fn sign(
        &self,
        plan: &CallPlan,
        request: &mut HttpRequest,
        identity: &SigningIdentity,
    ) -> Result<(), Error> {
        let time = self.skew.corrected(self.clock.now_system());
        self.signer.sign(request, identity, time, &plan.signing)?;
        Ok(())
    }

    /// Places the signed request on the context, runs `before_transmission`
    /// and hands the request back for sending.
    pub(crate) fn before_transmission(
        &self,
        context: &mut ExecutionContext,
        request: HttpRequest,
    ) -> Result<HttpRequest, Error> {
        context.set_request(request);
        context.transition(Phase::Transmitting);
        self.interceptors.run(InterceptorStage::BeforeTransmission, context)?;
        context
            .take_request()
            .ok_or_else(|| Error::configuration("request removed by an interceptor"))
    }

    pub(crate) fn transport_error(method: &Method, uri: &Uri, error: TransportError) -> Error {
        if let Some(limit) = error.body_limit() {
            return Error::ResponseBodyTooLarge {
                limit_bytes: limit.limit_bytes,
                actual_bytes: limit.actual_bytes,
                method: method.clone(),
                uri: redact_uri(uri),
            };
        }
        Error::Transport {
            kind: error.kind(),
            method: method.clone(),
            uri: redact_uri(uri),
            source: error.into_source(),
        }
    }

    pub(crate) fn attempt_timeout_error(timeout: Duration, method: &Method, uri: &Uri) -> Error {
        Error::AttemptTimeout {
            timeout_ms: timeout.as_millis(),
            method: method.clone(),
            uri: redact_uri(uri),
        }
    }

    /// Response-side stages of one attempt: hooks, classification, checksum
    /// validation and unmarshalling.
    pub(crate) fn handle_response<O: Operation>(
        &self,
        operation: &O,
        plan: &CallPlan,
        context: &mut ExecutionContext,
        response: HttpResponse,
    ) -> Result<O::Output, Error> {
        self.receive(operation, plan, context, response)?;
        if let Some((algorithm, expected)) = self.response_checksum(plan, context) {
            let response = Self::received(context)?;
            let algorithm = checksum::validate_bytes(algorithm, response.body(), &expected).into_result()?;
            debug!(algorithm = algorithm.as_str(), "validated response checksum");
        }
        self.unmarshal(operation, context)
    }

    /// Like [`handle_response`](Self::handle_response) for a successful
    /// response whose body is still streaming: `head` carries no body, and the
    /// checksum to check at end of stream is returned instead of validated.
    pub(crate) fn handle_streaming_head<O: Operation>(
        &self,
        operation: &O,
        plan: &CallPlan,
        context: &mut ExecutionContext,
        head: HttpResponse,
    ) -> Result<(O::Output, Option<(ChecksumAlgorithm, String)>), Error> {
        self.receive(operation, plan, context, head)?;
        let pending = self.response_checksum(plan, context);
        if let Some((algorithm, _)) = &pending {
            debug!(algorithm = algorithm.as_str(), "validating response checksum while streaming");
        }
        let output = self.unmarshal(operation, context)?;
        Ok((output, pending))
    }

    fn received(context: &ExecutionContext) -> Result<&HttpResponse, Error> {
        context
            .response()
            .ok_or_else(|| Error::configuration("response removed by an interceptor"))
    }

    /// Runs the receive hooks and turns error responses into errors.
    fn receive<O: Operation>(
        &self,
        operation: &O,
        plan: &CallPlan,
        context: &mut ExecutionContext,
        response: HttpResponse,
    ) -> Result<(), Error> {
        debug!(status = response.status().as_u16(), "received response");
        context.set_response(response);
        context.transition(Phase::Classifying);
        self.interceptors.run(InterceptorStage::AfterTransmission, context)?;
        self.interceptors.run(InterceptorStage::ModifyHttpResponse, context)?;
        self.interceptors.run(InterceptorStage::BeforeUnmarshalling, context)?;

        let response = Self::received(context)?;
        match plan.classifier.classify(response) {
            Classification::Success => Ok(()),
            Classification::ModeledError(modeled) => {
                let modeled = operation.unmarshal_error(response, modeled);
                let status = response.status().as_u16();
                let local = self.clock.now_system();
                let corrected = self.skew.observe(&modeled.code, response.headers(), local);
                if let Some(offset_ms) = corrected {
                    self.metrics.clock_skew_corrected(&self.service, offset_ms);
                }
                let kind = service_error_kind(status, &modeled.code, corrected.is_some());
                Err(Error::Service(ServiceError {
                    status,
                    code: modeled.code,
                    message: modeled.message,
                    request_id: modeled.request_id,
                    kind,
                }))
            }
            Classification::UnknownError { status, body } => Err(Error::UnknownService {
                status,
                body,
                request_id: request_id_header(response),
            }),
        }
    }

    fn response_checksum(
        &self,
        plan: &CallPlan,
        context: &ExecutionContext,
    ) -> Option<(ChecksumAlgorithm, String)> {
        if !plan
            .checksum
            .as_ref()
            .is_some_and(|spec| spec.validates_response(self.checksum_validation))
        {
            return None;
        }
        checksum::response_checksum(context.response()?.headers())
    }

    fn unmarshal<O: Operation>(
        &self,
        operation: &O,
        context: &mut ExecutionContext,
    ) -> Result<O::Output, Error> {
        let response = Self::received(context)?;
        let output = operation
            .unmarshal(response)
            .map_err(|source| Error::Unmarshal {
                operation: operation.name(),
                source,
            })?;
        context.set_output(output);
        self.interceptors.run(InterceptorStage::AfterUnmarshalling, context)?;
        self.interceptors.run(InterceptorStage::AfterExecution, context)?;
        context.transition(Phase::Success);
        context
            .take_output::<O::Output>()
            .ok_or_else(|| Error::configuration("output replaced with a value of another type"))
    }

    /// Query-string signs the marshalled request instead of sending it.
    pub(crate) fn presign(
        &self,
        plan: &CallPlan,
        request: &HttpRequest,
        identity: &SigningIdentity,
        expires_in: Duration,
    ) -> Result<Uri, Error> {
        let time = self.skew.corrected(self.clock.now_system());
        Ok(self
            .signer
            .presign(request, identity, time, &plan.signing, expires_in)?)
    }

    /// Whether an identity should be dropped after this failure.
    pub(crate) fn invalidates_identity(error: &Error) -> bool {
        error.service_code().is_some_and(is_expired_credential)
    }

    pub(crate) fn record_attempt(&self, context: &ExecutionContext, duration: Duration, error: Option<&Error>) {
        self.metrics.attempt(&AttemptRecord {
            service: &self.service,
            operation: context.operation(),
            attempt: context.attempt(),
            duration,
            status: context
                .response()
                .map(|response| response.status().as_u16())
                .or_else(|| error.and_then(Error::status)),
            error: error.map(Error::kind),
        });
        self.retry.observe_attempt(error.map(Error::kind));
    }

    /// Pacing delay before the next attempt is sent; see [`crate::retry::RetryMode::Adaptive`].
    pub(crate) fn send_delay(&self) -> Duration {
        let delay = self.retry.acquire_send_token();
        if !delay.is_zero() {
            debug!(delay_ms = duration_millis(delay), "pacing request send rate");
        }
        delay
    }

    /// Consults the retry strategy about a failed attempt. Errors that
    /// surface as-is never reach it.
    pub(crate) fn decide(
        &self,
        context: &ExecutionContext,
        error: &Error,
        method: &Method,
        remaining_call_time: Option<Duration>,
    ) -> RetryVerdict {
        let kind = error.kind();
        if surfaces_without_retry(kind) {
            return RetryVerdict::Stop(RetryStopReason::NotRetryable);
        }
        let retry_after = context
            .response()
            .and_then(|response| parse_retry_after(response.headers(), self.clock.now_system()));
        let policy_context = RetryPolicyContext {
            attempt: context.attempt(),
            error_kind: kind,
            error_code: error.service_code().map(str::to_owned),
            status: error.status(),
            transport_error_kind: error.transport_kind(),
            elapsed: context.elapsed(),
            retry_after,
            remaining_call_time,
            method: method.clone(),
            body_replayable: Self::body_replayable(context),
        };
        self.retry.should_retry(&policy_context)
    }

    /// Bookkeeping for a scheduled retry; returns the delay to wait.
    pub(crate) fn schedule_retry(
        &self,
        context: &mut ExecutionContext,
        error: &Error,
        delay: Duration,
        cost: u32,
    ) -> Duration {
        context.transition(Phase::Retrying);
        context.record_delay(delay);
        self.metrics.retry(&RetryRecord {
            service: &self.service,
            operation: context.operation(),
            attempt: context.attempt(),
            delay,
            cost,
            kind: error.kind(),
        });
        warn!(
            attempt = context.attempt(),
            max_attempts = context.max_attempts(),
            delay_ms = duration_millis(delay),
            error = %error,
            "retrying request"
        );
        delay
    }

    /// Shapes the error a failed call ends with.
    pub(crate) fn finish_failure(
        &self,
        context: &ExecutionContext,
        error: Error,
        stop_reason: RetryStopReason,
    ) -> Error {
        if error.kind().surfaces_directly() {
            return error;
        }
        if context.attempt() <= 1 && stop_reason == RetryStopReason::NotRetryable {
            return error;
        }
        let history = AttemptHistory {
            attempts: context.attempt(),
            delays: context.delays().to_vec(),
            attempt_durations: context.attempt_durations().to_vec(),
            last_status: error.status(),
            last_code: error.service_code().map(str::to_owned),
            stop_reason,
        };
        Error::RetriesExhausted {
            history,
            source: Box::new(error),
        }
    }

    pub(crate) fn on_success(&self, context: &ExecutionContext, last_acquired: u32) {
        self.retry.on_success(last_acquired);
        self.complete(context, None);
    }

    pub(crate) fn on_failure(&self, context: &mut ExecutionContext, error: &Error) {
        if !context.phase().is_terminal() {
            context.transition(Phase::Failed);
        }
        self.interceptors.run_failure(context, error);
        self.complete(context, Some(error));
    }

    fn complete(&self, context: &ExecutionContext, error: Option<&Error>) {
        self.metrics.call_complete(&CallRecord {
            service: &self.service,
            operation: context.operation(),
            attempts: context.attempt(),
            duration: context.elapsed(),
            error,
        });
    }

    pub(crate) fn call_timeout_error(&self, timeout: Duration, context: &ExecutionContext) -> Error {
        Error::CallTimeout {
            timeout_ms: timeout.as_millis(),
            attempts: context.attempt(),
        }
    }
}

/// Builder state shared by the async and blocking client builders.
#[derive(Clone)]
pub(crate) struct CoreBuilder {
    pub(crate) config: ClientConfig,
    pub(crate) interceptors: InterceptorChain,
    pub(crate) classifier: Option<Arc<dyn ResponseClassifier>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) skew: Option<Arc<ClockSkew>>,
    pub(crate) bucket: Option<Arc<RetryTokenBucket>>,
    pub(crate) metrics_enabled: bool,
    pub(crate) sinks: Vec<Arc<dyn MetricsSink>>,
    #[cfg(feature = "otel")]
    pub(crate) otel_enabled: bool,
}

impl CoreBuilder {
    pub(crate) fn new(service: impl Into<String>) -> Self {
        Self {
            config: ClientConfig::new(service),
            interceptors: InterceptorChain::new(),
            classifier: None,
            clock: Arc::new(SystemClock),
            skew: None,
            bucket: None,
            metrics_enabled: true,
            sinks: Vec::new(),
            #[cfg(feature = "otel")]
            otel_enabled: false,
        }
    }

    pub(crate) fn build(self) -> Result<PipelineCore, Error> {
        let signing = self.config.signing_params()?;
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .map(validate_endpoint)
            .transpose()?;
        let retry = match self.bucket {
            Some(bucket) => RetryStrategy::with_bucket(self.config.retry_policy.clone(), bucket),
            None => RetryStrategy::new(self.config.retry_policy.clone()),
        };
        let builtin = if self.metrics_enabled {
            PipelineMetrics::enabled()
        } else {
            PipelineMetrics::disabled()
        };
        #[allow(unused_mut)]
        let mut sinks = self.sinks;
        #[cfg(feature = "otel")]
        if self.otel_enabled {
            sinks.push(Arc::new(crate::metrics::OtelMetricsSink::new(
                self.config.client_name.clone(),
            )));
        }

        debug!(
            service = %self.config.service,
            region = %signing.region,
            max_attempts = retry.max_attempts(),
            interceptors = self.interceptors.len(),
            "built pipeline"
        );
        Ok(PipelineCore {
            service: self.config.service,
            endpoint,
            signing,
            signer: SigV4Signer::new(),
            clock: self.clock,
            skew: self.skew.unwrap_or_default(),
            retry,
            interceptors: self.interceptors,
            classifier: self
                .classifier
                .unwrap_or_else(|| Arc::new(JsonErrorClassifier)),
            metrics: MetricsFanout::new(builtin, sinks),
            checksum_calculation: self.config.checksum_calculation,
            checksum_validation: self.config.checksum_validation,
            attempt_timeout: self.config.attempt_timeout,
            call_timeout: self.config.call_timeout,
            max_response_body_bytes: self.config.max_response_body_bytes,
        })
    }
}

impl PipelineCore {
    /// Built-in counters with the live retry capacity filled in.
    pub(crate) fn metrics_snapshot(&self) -> PipelineMetricsSnapshot {
        let mut snapshot = self.metrics.builtin().snapshot();
        let bucket = self.retry.bucket();
        snapshot.retry_capacity_available = bucket.available();
        snapshot.retry_capacity = bucket.capacity();
        snapshot
    }
}

/// Kinds decided without the retry strategy. Interceptor and unmarshal
/// failures still reach it so a custom classifier can opt into retrying.
fn surfaces_without_retry(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Configuration
            | ErrorKind::ResponseTooLarge
            | ErrorKind::DataIntegrity
            | ErrorKind::Cancellation
            | ErrorKind::CallTimeout
    )
}

/// Buffered bodies get the checksum header now; streaming bodies carry it as
/// an `aws-chunked` trailer computed while the body is sent.
fn attach_request_checksum(
    request: &mut HttpRequest,
    algorithm: ChecksumAlgorithm,
    signing: &mut SigningParams,
    operation: &'static str,
) -> Result<(), Error> {
    let header_name = HeaderName::from_static(algorithm.header_name());
    if request.headers().contains_key(&header_name) {
        return Ok(());
    }
    match request.body() {
        SdkBody::Bytes(bytes) => {
            let value = checksum::compute(algorithm, bytes).to_base64();
            let value = HeaderValue::try_from(value).map_err(|source| Error::Marshal {
                operation,
                source: Box::new(source),
            })?;
            request.headers_mut().insert(header_name, value);
        }
        SdkBody::Stream(_) | SdkBody::Reader(_) => {
            signing.trailing_checksum = Some(algorithm);
        }
        SdkBody::Taken => {}
    }
    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use super::BlockingClient;
use crate::checksum::{ChecksumCalculation, ChecksumValidation};
use crate::classify::ResponseClassifier;
use crate::config::{ClientConfig, ClientProfile};
use crate::identity::{
    BlockingIdentityResolver, Credentials, EnvironmentIdentityResolver, StaticIdentityResolver,
};
use crate::interceptor::Interceptor;
use crate::metrics::MetricsSink;
use crate::orchestrator::CoreBuilder;
use crate::retry::{RetryPolicy, RetryTokenBucket};
use crate::skew::{Clock, ClockSkew};
use crate::transport::BlockingHttpTransport;

pub struct BlockingClientBuilder {
    core: CoreBuilder,
    transport: Option<Arc<dyn BlockingHttpTransport>>,
    identity: Option<Arc<dyn BlockingIdentityResolver>>,
}

impl BlockingClientBuilder {
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

    pub fn transport_arc(mut self, transport: Arc<dyn BlockingHttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: BlockingHttpTransport + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    pub fn identity_resolver_arc(mut self, identity: Arc<dyn BlockingIdentityResolver>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn identity_resolver<R>(self, identity: R) -> Self
    where
        R: BlockingIdentityResolver + 'static,
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

    pub fn build(self) -> crate::Result<BlockingClient> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(self.core.config.max_response_body_bytes)?,
        };
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(EnvironmentIdentityResolver::new()));
        let core = self.core.build()?;
        Ok(BlockingClient {
            core: Arc::new(core),
            transport,
            identity,
        })
    }
}

#[cfg(feature = "ureq-client")]
fn default_transport(max_response_body_bytes: usize) -> crate::Result<Arc<dyn BlockingHttpTransport>> {
    Ok(Arc::new(
        crate::transport::UreqTransport::new().max_response_body_bytes(max_response_body_bytes),
    ))
}

#[cfg(not(feature = "ureq-client"))]
fn default_transport(_max_response_body_bytes: usize) -> crate::Result<Arc<dyn BlockingHttpTransport>> {
    Err(crate::error::Error::configuration(
        "no transport configured and the `ureq-client` feature is disabled",
    ))
}

impl std::fmt::Debug for BlockingClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BlockingClientBuilder")
            .field("config", &self.core.config)
            .field("has_transport", &self.transport.is_some())
            .field("has_identity_resolver", &self.identity.is_some())
            .finish_non_exhaustive()
    }
}

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use http::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use http::{StatusCode, Uri};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{BlockingIdentityResolver, Credentials, IdentityError, IdentityResolver, SigningIdentity};
use crate::context::ExecutionAttributes;
use crate::error::{BoxError, TransportErrorKind};
use crate::message::{HttpRequest, HttpResponse};
use crate::transport::{BlockingHttpTransport, HttpTransport, TransportError};
use crate::util::truncate_body;

const PROVIDER: &str = "container";
const CONTAINER_HOST: &str = "http://169.254.170.2";

/// Retry behaviour of the resolver's own fetch loop; independent of the
/// client retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerResolverPolicy {
    max_attempts: u32,
    backoff: Duration,
    timeout: Duration,
}

impl ContainerResolverPolicy {
    pub const fn standard() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub const fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ContainerResolverPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
    expiration: Option<String>,
}

enum FetchOutcome {
    Resolved(SigningIdentity),
    Transient(BoxError),
    Fatal(IdentityError),
}

/// Fetches temporary credentials from a container metadata endpoint.
pub struct ContainerIdentityResolver<T> {
    transport: T,
    endpoint: Uri,
    authorization: Option<String>,
    policy: ContainerResolverPolicy,
}

impl<T> ContainerIdentityResolver<T> {
    pub fn new(transport: T, endpoint: Uri) -> Self {
        Self {
            transport,
            endpoint,
            authorization: None,
            policy: ContainerResolverPolicy::standard(),
        }
    }

    /// Builds the resolver from `AWS_CONTAINER_CREDENTIALS_FULL_URI` or
    /// `AWS_CONTAINER_CREDENTIALS_RELATIVE_URI`, plus
    /// `AWS_CONTAINER_AUTHORIZATION_TOKEN`.
    pub fn from_env(transport: T) -> Result<Self, IdentityError> {
        Self::from_lookup(transport, |name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(transport: T, lookup: F) -> Result<Self, IdentityError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = match (
            lookup("AWS_CONTAINER_CREDENTIALS_FULL_URI"),
            lookup("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI"),
        ) {
            (Some(full), _) => full,
            (None, Some(relative)) => format!("{CONTAINER_HOST}{relative}"),
            (None, None) => {
                return Err(IdentityError::Missing {
                    provider: PROVIDER,
                    message: "no container credentials endpoint is configured".to_owned(),
                });
            }
        };
        let endpoint = endpoint.parse::<Uri>().map_err(|_| IdentityError::Missing {
            provider: PROVIDER,
            message: format!("invalid container credentials endpoint: {endpoint}"),
        })?;

        let mut resolver = Self::new(transport, endpoint);
        if let Some(token) = lookup("AWS_CONTAINER_AUTHORIZATION_TOKEN") {
            resolver = resolver.authorization(token);
        }
        Ok(resolver)
    }

    pub fn authorization(mut self, token: impl Into<String>) -> Self {
        self.authorization = Some(token.into());
        self
    }

    pub fn policy(mut self, policy: ContainerResolverPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn request(&self) -> Result<HttpRequest, IdentityError> {
        let mut request = HttpRequest::get(self.endpoint.clone())
            .with_header(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.authorization {
            let value = HeaderValue::from_str(token).map_err(|_| IdentityError::Missing {
                provider: PROVIDER,
                message: "authorization token is not a valid header value".to_owned(),
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }

    fn interpret(&self, result: Result<HttpResponse, TransportError>) -> FetchOutcome {
        let response = match result {
            Ok(response) => response,
            Err(error) => return FetchOutcome::Transient(Box::new(error)),
        };

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return FetchOutcome::Transient(
                format!("metadata endpoint returned {status}: {}", truncate_body(response.body())).into(),
            );
        }
        if !status.is_success() {
            return FetchOutcome::Fatal(IdentityError::InvalidResponse {
                provider: PROVIDER,
                message: format!("status {status}: {}", truncate_body(response.body())),
            });
        }

        match parse_credentials(response.body()) {
            Ok(identity) => FetchOutcome::Resolved(identity),
            Err(error) => FetchOutcome::Fatal(error),
        }
    }

    fn exhausted(&self, last_error: Option<BoxError>) -> IdentityError {
        IdentityError::Fetch {
            provider: PROVIDER,
            attempts: self.policy.max_attempts,
            source: last_error.unwrap_or_else(|| "no fetch attempt was made".into()),
        }
    }
}

fn parse_credentials(body: &[u8]) -> Result<SigningIdentity, IdentityError> {
    let invalid = |message: String| IdentityError::InvalidResponse {
        provider: PROVIDER,
        message,
    };
    let payload: ContainerCredentials =
        serde_json::from_slice(body).map_err(|error| invalid(error.to_string()))?;

    let mut credentials = Credentials::new(payload.access_key_id, payload.secret_access_key);
    if let Some(token) = payload.token {
        credentials = credentials.session_token(token);
    }
    if let Some(expiration) = payload.expiration {
        let expiry = chrono::DateTime::parse_from_rfc3339(&expiration)
            .map_err(|error| invalid(format!("invalid Expiration {expiration}: {error}")))?;
        credentials = credentials.expiry(SystemTime::from(expiry));
    }
    Ok(credentials.into())
}

#[async_trait]
impl<T> IdentityResolver for ContainerIdentityResolver<T>
where
    T: HttpTransport,
{
    async fn resolve(&self, _attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        let mut last_error = None;
        for attempt in 1..=self.policy.max_attempts {
            let request = self.request()?;
            let result = match tokio::time::timeout(self.policy.timeout, self.transport.send(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::new(
                    TransportErrorKind::Timeout,
                    "container credentials request timed out",
                )),
            };
            match self.interpret(result) {
                FetchOutcome::Resolved(identity) => {
                    debug!(attempt, "fetched container credentials");
                    return Ok(identity);
                }
                FetchOutcome::Fatal(error) => return Err(error),
                FetchOutcome::Transient(error) => {
                    warn!(attempt, error = %error, "container credentials fetch failed");
                    last_error = Some(error);
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
            }
        }
        Err(self.exhausted(last_error))
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

impl<T> BlockingIdentityResolver for ContainerIdentityResolver<T>
where
    T: BlockingHttpTransport,
{
    fn resolve(&self, _attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        let mut last_error = None;
        for attempt in 1..=self.policy.max_attempts {
            let request = self.request()?;
            let result = self.transport.send(request, Some(self.policy.timeout));
            match self.interpret(result) {
                FetchOutcome::Resolved(identity) => {
                    debug!(attempt, "fetched container credentials");
                    return Ok(identity);
                }
                FetchOutcome::Fatal(error) => return Err(error),
                FetchOutcome::Transient(error) => {
                    warn!(attempt, error = %error, "container credentials fetch failed");
                    last_error = Some(error);
                    if attempt < self.policy.max_attempts {
                        std::thread::sleep(self.policy.backoff);
                    }
                }
            }
        }
        Err(self.exhausted(last_error))
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::{Duration, UNIX_EPOCH};

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use super::{ContainerIdentityResolver, ContainerResolverPolicy};
    use crate::context::ExecutionAttributes;
    use crate::error::TransportErrorKind;
    use crate::identity::{BlockingIdentityResolver, IdentityError, IdentityResolver};
    use crate::message::{HttpRequest, HttpResponse};
    use crate::transport::{BlockingHttpTransport, HttpTransport, TransportError};

    const BODY: &str = r#"{"AccessKeyId":"ASIAEXAMPLE","SecretAccessKey":"secret","Token":"session","Expiration":"2030-01-01T00:00:00Z"}"#;

    #[derive(Default)]
    struct Script {
        replies: Mutex<VecDeque<Result<(u16, &'static str), TransportErrorKind>>>,
        authorization: Mutex<Vec<Option<String>>>,
    }

    impl Script {
        fn new(replies: Vec<Result<(u16, &'static str), TransportErrorKind>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                authorization: Mutex::new(Vec::new()),
            }
        }

        fn reply(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.authorization.lock().expect("lock").push(
                request
                    .headers()
                    .get(http::header::AUTHORIZATION)
                    .and_then(|value| value.to_str().ok())
                    .map(ToOwned::to_owned),
            );
            match self.replies.lock().expect("lock").pop_front() {
                Some(Ok((status, body))) => Ok(HttpResponse::new(
                    StatusCode::from_u16(status).expect("valid status"),
                    HeaderMap::new(),
                    Bytes::from_static(body.as_bytes()),
                )),
                Some(Err(kind)) => Err(TransportError::new(kind, "scripted failure")),
                None => Err(TransportError::new(TransportErrorKind::Other, "script exhausted")),
            }
        }

        fn calls(&self) -> usize {
            self.authorization.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl HttpTransport for Script {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.reply(&request)
        }
    }

    impl BlockingHttpTransport for Script {
        fn send(&self, request: HttpRequest, _timeout: Option<Duration>) -> Result<HttpResponse, TransportError> {
            self.reply(&request)
        }
    }

    fn policy() -> ContainerResolverPolicy {
        ContainerResolverPolicy::standard().backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retries_transient_failures_then_parses_credentials() {
        let script = Script::new(vec![
            Err(TransportErrorKind::Connect),
            Ok((503, "busy")),
            Ok((200, BODY)),
        ]);
        let resolver = ContainerIdentityResolver::new(&script, "http://169.254.170.2/creds".parse().expect("uri"))
            .authorization("Bearer abc")
            .policy(policy());

        let identity = IdentityResolver::resolve(&resolver, &ExecutionAttributes::new())
            .await
            .expect("third attempt succeeds");
        let credentials = identity.credentials().expect("credentials");
        assert_eq!(credentials.access_key_id(), "ASIAEXAMPLE");
        assert_eq!(credentials.configured_session_token(), Some("session"));
        assert_eq!(
            credentials.configured_expiry(),
            Some(UNIX_EPOCH + Duration::from_secs(1_893_456_000))
        );
        assert_eq!(script.calls(), 3);
        assert_eq!(
            script.authorization.lock().expect("lock")[0].as_deref(),
            Some("Bearer abc")
        );
    }

    #[test]
    fn exhausting_attempts_reports_fetch_error() {
        let script = Script::new(vec![Ok((500, "")), Ok((500, "")), Ok((500, "")), Ok((200, BODY))]);
        let resolver = ContainerIdentityResolver::new(&script, "http://localhost/creds".parse().expect("uri"))
            .policy(policy());
        let error = BlockingIdentityResolver::resolve(&resolver, &ExecutionAttributes::new())
            .expect_err("all attempts fail");
        assert!(matches!(error, IdentityError::Fetch { attempts: 3, .. }));
        assert_eq!(script.calls(), 3);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let script = Script::new(vec![Ok((403, "denied")), Ok((200, BODY))]);
        let resolver = ContainerIdentityResolver::new(&script, "http://localhost/creds".parse().expect("uri"))
            .policy(policy());
        let error = BlockingIdentityResolver::resolve(&resolver, &ExecutionAttributes::new())
            .expect_err("403 is fatal");
        assert!(matches!(error, IdentityError::InvalidResponse { .. }));
        assert_eq!(script.calls(), 1);
    }

    #[test]
    fn endpoint_comes_from_relative_uri() {
        let resolver = ContainerIdentityResolver::from_lookup(Script::default(), |name| {
            (name == "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI").then(|| "/v2/credentials/abc".to_owned())
        })
        .expect("relative uri is enough");
        assert_eq!(resolver.endpoint.to_string(), "http://169.254.170.2/v2/credentials/abc");

        assert!(ContainerIdentityResolver::from_lookup(Script::default(), |_| None).is_err());
    }
}

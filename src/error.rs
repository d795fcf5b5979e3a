use std::time::Duration;

use http::Method;
use thiserror::Error;

use crate::checksum::ChecksumAlgorithm;
use crate::identity::IdentityError;
use crate::interceptor::InterceptorStage;
use crate::retry::classification::TRANSIENT_STATUS_CODES;
use crate::signer::SigningError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Reset,
    Timeout,
    BodyTooLarge,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Reset => "reset",
            Self::Timeout => "timeout",
            Self::BodyTooLarge => "body_too_large",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Coarse classification used by the retry engine and by callers that
/// branch on failure category rather than on individual variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    Configuration,
    Interceptor,
    Transport,
    Timeout,
    ResponseTooLarge,
    Throttling,
    ClockSkew,
    TransientService,
    ModeledService,
    UnknownService,
    DataIntegrity,
    Unmarshal,
    Cancellation,
    CallTimeout,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Interceptor => "interceptor",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ResponseTooLarge => "response_too_large",
            Self::Throttling => "throttling",
            Self::ClockSkew => "clock_skew",
            Self::TransientService => "transient_service",
            Self::ModeledService => "modeled_service",
            Self::UnknownService => "unknown_service",
            Self::DataIntegrity => "data_integrity",
            Self::Unmarshal => "unmarshal",
            Self::Cancellation => "cancellation",
            Self::CallTimeout => "call_timeout",
        }
    }

    /// Kinds the standard retry classification treats as transient.
    pub const fn is_retryable_by_default(self) -> bool {
        matches!(
            self,
            Self::Transport
                | Self::Timeout
                | Self::Throttling
                | Self::ClockSkew
                | Self::TransientService
        )
    }

    /// Kinds that are surfaced as-is instead of being wrapped with an attempt history.
    pub(crate) const fn surfaces_directly(self) -> bool {
        matches!(
            self,
            Self::Configuration
                | Self::Interceptor
                | Self::ResponseTooLarge
                | Self::DataIntegrity
                | Self::Cancellation
                | Self::CallTimeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Configuration,
    IdentityResolution,
    Signing,
    Marshal,
    Interceptor,
    Transport,
    AttemptTimeout,
    CallTimeout,
    ResponseBodyTooLarge,
    Service,
    UnknownService,
    ChecksumMismatch,
    Unmarshal,
    Cancelled,
    RetriesExhausted,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::IdentityResolution => "identity_resolution",
            Self::Signing => "signing",
            Self::Marshal => "marshal",
            Self::Interceptor => "interceptor",
            Self::Transport => "transport",
            Self::AttemptTimeout => "attempt_timeout",
            Self::CallTimeout => "call_timeout",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::Service => "service",
            Self::UnknownService => "unknown_service",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::Unmarshal => "unmarshal",
            Self::Cancelled => "cancelled",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// Why the retry engine stopped retrying a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryStopReason {
    NotRetryable,
    MaxAttemptsReached,
    CapacityExhausted,
    BodyNotReplayable,
    CallDeadline,
}

impl RetryStopReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotRetryable => "not retryable",
            Self::MaxAttemptsReached => "max attempts reached",
            Self::CapacityExhausted => "retry capacity exhausted",
            Self::BodyNotReplayable => "request body not replayable",
            Self::CallDeadline => "call deadline reached",
        }
    }
}

impl std::fmt::Display for RetryStopReason {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// What happened across all attempts of a failed call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptHistory {
    pub attempts: u32,
    pub delays: Vec<Duration>,
    pub attempt_durations: Vec<Duration>,
    pub last_status: Option<u16>,
    pub last_code: Option<String>,
    pub stop_reason: RetryStopReason,
}

impl AttemptHistory {
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}

impl std::fmt::Display for AttemptHistory {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let noun = if self.attempts == 1 {
            "attempt"
        } else {
            "attempts"
        };
        write!(
            formatter,
            "{} {noun} ({})",
            self.attempts, self.stop_reason
        )
    }
}

/// A classified error response returned by the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceError {
    pub status: u16,
    pub code: String,
    pub message: Option<String>,
    pub request_id: Option<String>,
    pub kind: ErrorKind,
}

impl ServiceError {
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{} (status {})", self.code, self.status)?;
        if let Some(message) = &self.message {
            write!(formatter, ": {message}")?;
        }
        if let Some(request_id) = &self.request_id {
            write!(formatter, " [request id {request_id}]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid client configuration: {message}")]
    Configuration { message: String },
    #[error("failed to resolve signing identity: {source}")]
    IdentityResolution {
        #[source]
        source: IdentityError,
    },
    #[error("failed to sign request: {source}")]
    Signing {
        #[source]
        source: SigningError,
    },
    #[error("failed to marshal {operation} request: {source}")]
    Marshal {
        operation: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("interceptor {interceptor} failed in {stage}: {source}")]
    Interceptor {
        stage: InterceptorStage,
        interceptor: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("attempt timed out after {timeout_ms}ms for {method} {uri}")]
    AttemptTimeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("call timed out after {timeout_ms}ms ({attempts} attempts)")]
    CallTimeout { timeout_ms: u128, attempts: u32 },
    #[error("response body too large ({actual_bytes} > {limit_bytes}) for {method} {uri}")]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("service error {0}")]
    Service(ServiceError),
    #[error("unknown service error (status {status}): {body}")]
    UnknownService {
        status: u16,
        body: String,
        request_id: Option<String>,
    },
    #[error("response checksum mismatch ({algorithm}): expected {expected}, computed {actual}")]
    ChecksumMismatch {
        algorithm: ChecksumAlgorithm,
        expected: String,
        actual: String,
    },
    #[error("failed to unmarshal {operation} response: {source}")]
    Unmarshal {
        operation: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("call was cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
    #[error("request failed after {history}: {source}")]
    RetriesExhausted {
        history: AttemptHistory,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration { .. } => ErrorCode::Configuration,
            Self::IdentityResolution { .. } => ErrorCode::IdentityResolution,
            Self::Signing { .. } => ErrorCode::Signing,
            Self::Marshal { .. } => ErrorCode::Marshal,
            Self::Interceptor { .. } => ErrorCode::Interceptor,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::AttemptTimeout { .. } => ErrorCode::AttemptTimeout,
            Self::CallTimeout { .. } => ErrorCode::CallTimeout,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::Service(_) => ErrorCode::Service,
            Self::UnknownService { .. } => ErrorCode::UnknownService,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::Unmarshal { .. } => ErrorCode::Unmarshal,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
        }
    }

    /// Failure category; looks through [`Error::RetriesExhausted`] to the final cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. }
            | Self::IdentityResolution { .. }
            | Self::Signing { .. }
            | Self::Marshal { .. } => ErrorKind::Configuration,
            Self::Interceptor { .. } => ErrorKind::Interceptor,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::AttemptTimeout { .. } => ErrorKind::Timeout,
            Self::CallTimeout { .. } => ErrorKind::CallTimeout,
            Self::ResponseBodyTooLarge { .. } => ErrorKind::ResponseTooLarge,
            Self::Service(service) => service.kind,
            Self::UnknownService { status, .. } => match *status {
                429 => ErrorKind::Throttling,
                status if TRANSIENT_STATUS_CODES.contains(&status) => ErrorKind::TransientService,
                _ => ErrorKind::UnknownService,
            },
            Self::ChecksumMismatch { .. } => ErrorKind::DataIntegrity,
            Self::Unmarshal { .. } => ErrorKind::Unmarshal,
            Self::Cancelled { .. } => ErrorKind::Cancellation,
            Self::RetriesExhausted { source, .. } => source.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable_by_default()
    }

    pub fn history(&self) -> Option<&AttemptHistory> {
        match self {
            Self::RetriesExhausted { history, .. } => Some(history),
            _ => None,
        }
    }

    /// Number of attempts made before the call ended, when the error carries it.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { history, .. } => Some(history.attempts),
            Self::Cancelled { attempts } | Self::CallTimeout { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Service(service) => Some(service),
            Self::RetriesExhausted { source, .. } => source.service_error(),
            _ => None,
        }
    }

    /// HTTP status of the response that produced this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Service(service) => Some(service.status),
            Self::UnknownService { status, .. } => Some(*status),
            Self::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Service(service) => service.request_id.as_deref(),
            Self::UnknownService { request_id, .. } => request_id.as_deref(),
            Self::RetriesExhausted { source, .. } => source.request_id(),
            _ => None,
        }
    }

    pub(crate) fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            Self::AttemptTimeout { .. } => Some(TransportErrorKind::Timeout),
            _ => None,
        }
    }

    pub(crate) fn service_code(&self) -> Option<&str> {
        match self {
            Self::Service(service) => Some(service.code.as_str()),
            _ => None,
        }
    }
}

impl From<IdentityError> for Error {
    fn from(source: IdentityError) -> Self {
        Self::IdentityResolution { source }
    }
}

impl From<SigningError> for Error {
    fn from(source: SigningError) -> Self {
        Self::Signing { source }
    }
}

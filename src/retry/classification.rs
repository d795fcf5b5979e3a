//! Mapping of service error codes and statuses onto [`ErrorKind`].

use crate::error::ErrorKind;
use crate::skew::CLOCK_SKEW_ERROR_CODES;

pub const THROTTLING_ERROR_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottledException",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "TransactionInProgressException",
    "RequestLimitExceeded",
    "BandwidthLimitExceeded",
    "LimitExceededException",
    "RequestThrottled",
    "SlowDown",
    "PriorRequestNotComplete",
    "EC2ThrottledException",
];

pub const TRANSIENT_ERROR_CODES: &[&str] = &[
    "RequestTimeout",
    "RequestTimeoutException",
    "InternalError",
    "ServiceUnavailable",
];

pub const TRANSIENT_STATUS_CODES: &[u16] = &[500, 502, 503, 504];

/// Codes after which the cached identity is dropped so the next attempt
/// resolves fresh credentials.
pub const EXPIRED_CREDENTIAL_ERROR_CODES: &[&str] =
    &["ExpiredToken", "ExpiredTokenException", "TokenRefreshRequired"];

pub fn is_throttling(status: u16, code: Option<&str>) -> bool {
    status == 429 || code.is_some_and(|code| THROTTLING_ERROR_CODES.contains(&code))
}

pub fn is_transient(status: u16, code: Option<&str>) -> bool {
    TRANSIENT_STATUS_CODES.contains(&status)
        || code.is_some_and(|code| TRANSIENT_ERROR_CODES.contains(&code))
}

pub fn is_expired_credential(code: &str) -> bool {
    EXPIRED_CREDENTIAL_ERROR_CODES.contains(&code)
}

/// Kind of a modeled service error. `skew_corrected` reports whether the
/// response just triggered a clock correction, which turns signature
/// failures into retryable skew errors.
pub fn service_error_kind(status: u16, code: &str, skew_corrected: bool) -> ErrorKind {
    if is_throttling(status, Some(code)) {
        ErrorKind::Throttling
    } else if skew_corrected || CLOCK_SKEW_ERROR_CODES.contains(&code) {
        ErrorKind::ClockSkew
    } else if is_transient(status, Some(code)) {
        ErrorKind::TransientService
    } else {
        ErrorKind::ModeledService
    }
}

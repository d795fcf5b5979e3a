//! Client configuration, presets and environment overrides.

use std::time::Duration;

use crate::checksum::{ChecksumCalculation, ChecksumValidation};
use crate::error::Error;
use crate::retry::{RetryMode, RetryPolicy};
use crate::signer::SigningParams;
use crate::transport::DEFAULT_MAX_RESPONSE_BODY_BYTES;

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CLIENT_NAME: &str = "sdkx";

pub const ENV_MAX_ATTEMPTS: &str = "AWS_MAX_ATTEMPTS";
pub const ENV_RETRY_MODE: &str = "AWS_RETRY_MODE";
pub const ENV_REGION: &str = "AWS_REGION";
pub const ENV_ENDPOINT_URL: &str = "AWS_ENDPOINT_URL";
pub const ENV_REQUEST_CHECKSUM_CALCULATION: &str = "AWS_REQUEST_CHECKSUM_CALCULATION";
pub const ENV_RESPONSE_CHECKSUM_VALIDATION: &str = "AWS_RESPONSE_CHECKSUM_VALIDATION";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    #[default]
    StandardSdk,
    LowLatency,
    HighThroughput,
}

#[derive(Clone, Debug)]
pub struct ProfileDefaults {
    pub attempt_timeout: Duration,
    pub call_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
}

impl ClientProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::StandardSdk => ProfileDefaults {
                attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
                call_timeout: None,
                retry_policy: RetryPolicy::standard(),
            },
            Self::LowLatency => ProfileDefaults {
                attempt_timeout: Duration::from_secs(2),
                call_timeout: Some(Duration::from_secs(5)),
                retry_policy: RetryPolicy::standard()
                    .max_attempts(2)
                    .base_delay(Duration::from_millis(50))
                    .max_delay(Duration::from_millis(300)),
            },
            Self::HighThroughput => ProfileDefaults {
                attempt_timeout: Duration::from_secs(20),
                call_timeout: Some(Duration::from_secs(60)),
                retry_policy: RetryPolicy::standard()
                    .max_attempts(4)
                    .base_delay(Duration::from_millis(150))
                    .max_delay(Duration::from_secs(3)),
            },
        }
    }
}

/// Everything a client needs apart from its collaborators (transport,
/// identity, interceptors).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub service: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub retry_policy: RetryPolicy,
    pub attempt_timeout: Duration,
    pub call_timeout: Option<Duration>,
    pub checksum_calculation: ChecksumCalculation,
    pub checksum_validation: ChecksumValidation,
    pub double_uri_encode: bool,
    pub content_sha256_header: bool,
    pub unsigned_payload: bool,
    pub max_response_body_bytes: usize,
    pub client_name: String,
}

impl ClientConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            region: None,
            endpoint: None,
            retry_policy: RetryPolicy::standard(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            call_timeout: None,
            checksum_calculation: ChecksumCalculation::default(),
            checksum_validation: ChecksumValidation::default(),
            double_uri_encode: true,
            content_sha256_header: false,
            unsigned_payload: false,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
        }
    }

    /// `new(service)` with the process environment applied.
    pub fn from_env(service: impl Into<String>) -> crate::Result<Self> {
        Self::new(service).apply_env_from(|name| std::env::var(name).ok())
    }

    pub fn apply_profile(mut self, profile: ClientProfile) -> Self {
        let defaults = profile.defaults();
        self.attempt_timeout = defaults.attempt_timeout;
        self.call_timeout = defaults.call_timeout;
        self.retry_policy = defaults.retry_policy;
        self
    }

    /// Applies the `AWS_*` overrides found through `lookup`. Unset or blank
    /// variables are ignored; malformed values are configuration errors.
    pub fn apply_env_from<F>(mut self, lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        if let Some(mode) = read(ENV_RETRY_MODE) {
            let mode = mode.parse::<RetryMode>()?;
            self.retry_policy = self.retry_policy.mode(mode);
        }
        if let Some(max_attempts) = read(ENV_MAX_ATTEMPTS) {
            let max_attempts = max_attempts
                .parse::<u32>()
                .ok()
                .filter(|value| *value >= 1)
                .ok_or_else(|| {
                    Error::configuration(format!(
                        "{ENV_MAX_ATTEMPTS} must be a positive integer, got {max_attempts}"
                    ))
                })?;
            self.retry_policy = self.retry_policy.max_attempts(max_attempts);
        }
        if let Some(region) = read(ENV_REGION) {
            self.region = Some(region);
        }
        if let Some(endpoint) = read(ENV_ENDPOINT_URL) {
            self.endpoint = Some(endpoint);
        }
        if let Some(mode) = read(ENV_REQUEST_CHECKSUM_CALCULATION) {
            self.checksum_calculation = mode.parse()?;
        }
        if let Some(mode) = read(ENV_RESPONSE_CHECKSUM_VALIDATION) {
            self.checksum_validation = mode.parse()?;
        }
        Ok(self)
    }

    /// Base signing parameters for this client.
    pub fn signing_params(&self) -> crate::Result<SigningParams> {
        let region = self
            .region
            .as_deref()
            .ok_or_else(|| Error::configuration("missing region"))?;
        if self.service.trim().is_empty() {
            return Err(Error::configuration("missing signing service name"));
        }
        Ok(SigningParams::new(region, self.service.as_str())
            .double_uri_encode(self.double_uri_encode)
            .content_sha256_header(self.content_sha256_header)
            .unsigned_payload(self.unsigned_payload))
    }
}

//! Payload checksums: computing request checksums and validating the ones a
//! service returns.

mod body;

use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::HeaderMap;
use sha1::Digest;

pub use body::{ValidatingBody, ValidatingReader};

use crate::error::Error;

pub const X_AMZ_TRAILER: &str = "x-amz-trailer";
pub const X_AMZ_SDK_CHECKSUM_ALGORITHM: &str = "x-amz-sdk-checksum-algorithm";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    Crc32,
    Crc32c,
    Sha1,
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    /// Order in which response checksums are preferred when several are present.
    pub const VALIDATION_PRIORITY: [Self; 5] =
        [Self::Crc32c, Self::Crc32, Self::Sha1, Self::Sha256, Self::Md5];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Crc32 => "CRC32",
            Self::Crc32c => "CRC32C",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Md5 => "MD5",
        }
    }

    pub const fn header_name(self) -> &'static str {
        match self {
            Self::Crc32 => "x-amz-checksum-crc32",
            Self::Crc32c => "x-amz-checksum-crc32c",
            Self::Sha1 => "x-amz-checksum-sha1",
            Self::Sha256 => "x-amz-checksum-sha256",
            Self::Md5 => "content-md5",
        }
    }

    pub const fn digest_len(self) -> usize {
        match self {
            Self::Crc32 | Self::Crc32c => 4,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Md5 => 16,
        }
    }

    pub(crate) const fn base64_len(self) -> usize {
        self.digest_len().div_ceil(3) * 4
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let algorithm = match value.trim().to_ascii_uppercase().as_str() {
            "CRC32" => Self::Crc32,
            "CRC32C" => Self::Crc32c,
            "SHA1" => Self::Sha1,
            "SHA256" => Self::Sha256,
            "MD5" => Self::Md5,
            _ => {
                return Err(Error::configuration(format!(
                    "unsupported checksum algorithm: {value}"
                )));
            }
        };
        Ok(algorithm)
    }
}

/// Per-operation checksum behaviour, supplied by the operation and stored on
/// the execution context.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksumSpec {
    pub request_algorithm: Option<ChecksumAlgorithm>,
    pub request_checksum_required: bool,
    pub request_checksum_supported: bool,
    pub response_checksum_supported: bool,
    pub response_validation_enabled: bool,
}

impl ChecksumSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.request_algorithm = Some(algorithm);
        self.request_checksum_supported = true;
        self
    }

    pub fn request_checksum_required(mut self, required: bool) -> Self {
        self.request_checksum_required = required;
        self
    }

    pub fn request_checksum_supported(mut self, supported: bool) -> Self {
        self.request_checksum_supported = supported;
        self
    }

    pub fn response_checksum_supported(mut self, supported: bool) -> Self {
        self.response_checksum_supported = supported;
        self
    }

    pub fn response_validation_enabled(mut self, enabled: bool) -> Self {
        self.response_validation_enabled = enabled;
        self
    }

    /// Algorithm to attach to the request under `mode`, if any.
    pub fn request_checksum(&self, mode: ChecksumCalculation) -> Option<ChecksumAlgorithm> {
        let wanted = self.request_algorithm.is_some()
            || self.request_checksum_required
            || (mode == ChecksumCalculation::WhenSupported && self.request_checksum_supported);
        wanted.then(|| self.request_algorithm.unwrap_or(ChecksumAlgorithm::Crc32))
    }

    pub fn validates_response(&self, mode: ChecksumValidation) -> bool {
        match mode {
            ChecksumValidation::WhenSupported => {
                self.response_checksum_supported || self.response_validation_enabled
            }
            ChecksumValidation::WhenRequired => self.response_validation_enabled,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumCalculation {
    #[default]
    WhenSupported,
    WhenRequired,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumValidation {
    #[default]
    WhenSupported,
    WhenRequired,
}

fn parse_mode(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "when_supported" => Some(true),
        "when_required" => Some(false),
        _ => None,
    }
}

impl FromStr for ChecksumCalculation {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match parse_mode(value) {
            Some(true) => Ok(Self::WhenSupported),
            Some(false) => Ok(Self::WhenRequired),
            None => Err(Error::configuration(format!(
                "invalid request checksum calculation mode: {value}"
            ))),
        }
    }
}

impl FromStr for ChecksumValidation {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match parse_mode(value) {
            Some(true) => Ok(Self::WhenSupported),
            Some(false) => Ok(Self::WhenRequired),
            None => Err(Error::configuration(format!(
                "invalid response checksum validation mode: {value}"
            ))),
        }
    }
}

enum Hasher {
    Crc32(crc32fast::Hasher),
    Crc32c(u32),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Md5(md5::Context),
}

/// Running checksum accumulator. [`ChecksumState::finalize`] consumes it, so a
/// digest is produced exactly once.
pub struct ChecksumState {
    algorithm: ChecksumAlgorithm,
    hasher: Hasher,
}

impl ChecksumState {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        let hasher = match algorithm {
            ChecksumAlgorithm::Crc32 => Hasher::Crc32(crc32fast::Hasher::new()),
            ChecksumAlgorithm::Crc32c => Hasher::Crc32c(0),
            ChecksumAlgorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
        };
        Self { algorithm, hasher }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Crc32(hasher) => hasher.update(data),
            Hasher::Crc32c(crc) => *crc = crc32c::crc32c_append(*crc, data),
            Hasher::Sha1(hasher) => hasher.update(data),
            Hasher::Sha256(hasher) => hasher.update(data),
            Hasher::Md5(context) => context.consume(data),
        }
    }

    pub fn finalize(self) -> Checksum {
        let digest = match self.hasher {
            Hasher::Crc32(hasher) => hasher.finalize().to_be_bytes().to_vec(),
            Hasher::Crc32c(crc) => crc.to_be_bytes().to_vec(),
            Hasher::Sha1(hasher) => hasher.finalize().to_vec(),
            Hasher::Sha256(hasher) => hasher.finalize().to_vec(),
            Hasher::Md5(context) => context.compute().0.to_vec(),
        };
        Checksum {
            algorithm: self.algorithm,
            digest,
        }
    }

    /// Finalizes and compares against a base64 `expected` value.
    pub fn validate(self, expected: &str) -> ChecksumOutcome {
        let checksum = self.finalize();
        let actual = checksum.to_base64();
        if actual == expected.trim() {
            ChecksumOutcome::Valid {
                algorithm: checksum.algorithm,
            }
        } else {
            ChecksumOutcome::Mismatch {
                algorithm: checksum.algorithm,
                expected: expected.trim().to_owned(),
                actual,
            }
        }
    }
}

impl std::fmt::Debug for ChecksumState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ChecksumState")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    digest: Vec<u8>,
}

impl Checksum {
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.digest)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChecksumOutcome {
    Valid {
        algorithm: ChecksumAlgorithm,
    },
    Mismatch {
        algorithm: ChecksumAlgorithm,
        expected: String,
        actual: String,
    },
}

impl ChecksumOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    pub fn into_result(self) -> Result<ChecksumAlgorithm, Error> {
        match self {
            Self::Valid { algorithm } => Ok(algorithm),
            Self::Mismatch {
                algorithm,
                expected,
                actual,
            } => Err(Error::ChecksumMismatch {
                algorithm,
                expected,
                actual,
            }),
        }
    }
}

pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Checksum {
    let mut state = ChecksumState::new(algorithm);
    state.update(data);
    state.finalize()
}

pub fn validate_bytes(algorithm: ChecksumAlgorithm, data: &[u8], expected: &str) -> ChecksumOutcome {
    let mut state = ChecksumState::new(algorithm);
    state.update(data);
    state.validate(expected)
}

/// Picks the preferred checksum a response carries. Composite multipart
/// values (`<base64>-<parts>`) cannot be checked against the whole body and
/// are skipped.
pub fn response_checksum(headers: &HeaderMap) -> Option<(ChecksumAlgorithm, String)> {
    ChecksumAlgorithm::VALIDATION_PRIORITY
        .into_iter()
        .find_map(|algorithm| {
            let value = headers.get(algorithm.header_name())?.to_str().ok()?.trim();
            if value.is_empty() || is_composite(value) {
                return None;
            }
            Some((algorithm, value.to_owned()))
        })
}

fn is_composite(value: &str) -> bool {
    value
        .rsplit_once('-')
        .is_some_and(|(_, parts)| !parts.is_empty() && parts.bytes().all(|b| b.is_ascii_digit()))
}

//! Wall-clock access and clock-skew correction.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use http::header::DATE;
use tracing::warn;

use crate::util::header_str;

pub trait Clock: Send + Sync {
    fn now_system(&self) -> SystemTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis_since_epoch: AtomicI64,
}

impl ManualClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            millis_since_epoch: AtomicI64::new(to_epoch_millis(now)),
        }
    }

    pub fn set(&self, now: SystemTime) {
        self.millis_since_epoch
            .store(to_epoch_millis(now), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis_since_epoch.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_system(&self) -> SystemTime {
        offset_time(UNIX_EPOCH, self.millis_since_epoch.load(Ordering::SeqCst))
    }
}

/// Error codes that always indicate the request time was unacceptable.
pub const CLOCK_SKEW_ERROR_CODES: &[&str] = &[
    "RequestTimeTooSkewed",
    "RequestExpired",
    "RequestInTheFuture",
];

/// Error codes that may be caused by skew but also by bad credentials; these
/// only correct the clock when the server date is far enough off.
pub const SIGNATURE_ERROR_CODES: &[&str] = &[
    "InvalidSignatureException",
    "SignatureDoesNotMatch",
    "AuthFailure",
];

pub const DEFAULT_SKEW_THRESHOLD: Duration = Duration::from_secs(4 * 60);

/// `Date` has one-second resolution; explicit skew codes only move the offset
/// when the corrected clock is further off than that.
const DATE_RESOLUTION: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkewState {
    Unskewed,
    Corrected { offset_ms: i64 },
}

/// Client-wide offset between the service clock and the local clock.
#[derive(Debug)]
pub struct ClockSkew {
    offset_ms: AtomicI64,
    corrections: AtomicU64,
    threshold: Duration,
}

impl ClockSkew {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_SKEW_THRESHOLD)
    }

    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            corrections: AtomicU64::new(0),
            threshold,
        }
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SkewState {
        if self.corrections.load(Ordering::Acquire) == 0 {
            SkewState::Unskewed
        } else {
            SkewState::Corrected {
                offset_ms: self.offset_ms(),
            }
        }
    }

    pub fn corrections(&self) -> u64 {
        self.corrections.load(Ordering::Relaxed)
    }

    /// Local time shifted by the current offset; every signature uses this.
    pub fn corrected(&self, local: SystemTime) -> SystemTime {
        offset_time(local, self.offset_ms())
    }

    /// Replaces the offset with `server - local`. Repeating the same sample is
    /// a no-op and is not counted as another correction.
    pub fn correct(&self, server_time: SystemTime, local_time: SystemTime) -> i64 {
        let delta = to_epoch_millis(server_time).saturating_sub(to_epoch_millis(local_time));
        let previous = self.offset_ms.swap(delta, Ordering::AcqRel);
        if previous != delta || self.corrections.load(Ordering::Acquire) == 0 {
            self.corrections.fetch_add(1, Ordering::AcqRel);
        }
        delta
    }

    /// Whether `code` together with the response `Date` indicates skew that the
    /// current offset does not already account for.
    pub fn detect(&self, code: &str, headers: &HeaderMap, local_time: SystemTime) -> Option<SystemTime> {
        let explicit = CLOCK_SKEW_ERROR_CODES.contains(&code);
        if !explicit && !SIGNATURE_ERROR_CODES.contains(&code) {
            return None;
        }

        let server_time = header_str(headers, DATE.as_str())
            .and_then(|value| httpdate::parse_http_date(value).ok())?;
        let corrected = self.corrected(local_time);
        let drift = match server_time.duration_since(corrected) {
            Ok(ahead) => ahead,
            Err(behind) => behind.duration(),
        };
        let threshold = if explicit {
            DATE_RESOLUTION
        } else {
            self.threshold
        };
        (drift > threshold).then_some(server_time)
    }

    /// Detects and applies a correction from an error response. Returns the
    /// new offset when one was applied.
    pub(crate) fn observe(&self, code: &str, headers: &HeaderMap, local_time: SystemTime) -> Option<i64> {
        let server_time = self.detect(code, headers, local_time)?;
        let previous = self.offset_ms();
        let offset_ms = self.correct(server_time, local_time);
        warn!(
            code,
            previous_offset_ms = previous,
            offset_ms,
            "corrected clock skew from service date"
        );
        Some(offset_ms)
    }
}

impl Default for ClockSkew {
    fn default() -> Self {
        Self::new()
    }
}

fn to_epoch_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_millis()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

fn offset_time(base: SystemTime, offset_ms: i64) -> SystemTime {
    let magnitude = Duration::from_millis(offset_ms.unsigned_abs());
    if offset_ms >= 0 {
        base.checked_add(magnitude).unwrap_or(base)
    } else {
        base.checked_sub(magnitude).unwrap_or(base)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use http::HeaderMap;
    use http::header::DATE;

    use super::{Clock, ClockSkew, ManualClock, SkewState};

    fn headers_with_date(time: SystemTime) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            DATE,
            httpdate::fmt_http_date(time).parse().expect("valid date header"),
        );
        headers
    }

    fn local() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn explicit_skew_code_corrects_offset() {
        let skew = ClockSkew::new();
        let server = local() + Duration::from_secs(15 * 60);
        let offset = skew.observe("RequestTimeTooSkewed", &headers_with_date(server), local());

        assert_eq!(offset, Some(15 * 60 * 1000));
        assert_eq!(
            skew.state(),
            SkewState::Corrected {
                offset_ms: 15 * 60 * 1000
            }
        );
        assert_eq!(skew.corrected(local()), server);
    }

    #[test]
    fn applying_the_same_sample_twice_is_idempotent() {
        let skew = ClockSkew::new();
        let server = local() - Duration::from_secs(600);
        let first = skew.correct(server, local());
        let second = skew.correct(server, local());
        assert_eq!(first, second);
        assert_eq!(skew.offset_ms(), -600_000);
        assert_eq!(skew.corrections(), 1);
    }

    #[test]
    fn signature_errors_after_a_correction_compare_against_the_corrected_clock() {
        let skew = ClockSkew::new();
        let server = local() + Duration::from_secs(3600);
        let headers = headers_with_date(server);
        assert_eq!(
            skew.observe("RequestTimeTooSkewed", &headers, local()),
            Some(3_600_000)
        );

        for _ in 0..3 {
            assert_eq!(skew.observe("SignatureDoesNotMatch", &headers, local()), None);
        }
        assert_eq!(skew.corrections(), 1);
        assert_eq!(skew.offset_ms(), 3_600_000);
    }

    #[test]
    fn explicit_codes_only_move_an_offset_that_is_still_wrong() {
        let skew = ClockSkew::new();
        let server = local() + Duration::from_secs(3600);
        assert!(skew.observe("RequestExpired", &headers_with_date(server), local()).is_some());
        assert_eq!(skew.observe("RequestExpired", &headers_with_date(server), local()), None);

        let drifted = server + Duration::from_secs(30);
        assert_eq!(
            skew.observe("RequestExpired", &headers_with_date(drifted), local()),
            Some(3_630_000)
        );
        assert_eq!(skew.corrections(), 2);
    }

    #[test]
    fn signature_codes_need_drift_above_threshold() {
        let skew = ClockSkew::new();
        let small = local() + Duration::from_secs(60);
        assert_eq!(
            skew.observe("SignatureDoesNotMatch", &headers_with_date(small), local()),
            None
        );
        assert_eq!(skew.state(), SkewState::Unskewed);

        let large = local() + Duration::from_secs(10 * 60);
        assert!(
            skew.observe("InvalidSignatureException", &headers_with_date(large), local())
                .is_some()
        );
    }

    #[test]
    fn missing_or_unparseable_date_leaves_state_unchanged() {
        let skew = ClockSkew::new();
        assert_eq!(skew.observe("RequestExpired", &HeaderMap::new(), local()), None);

        let mut headers = HeaderMap::new();
        headers.insert(DATE, "yesterday".parse().expect("valid header"));
        assert_eq!(skew.observe("RequestExpired", &headers, local()), None);
        assert_eq!(skew.state(), SkewState::Unskewed);
    }

    #[test]
    fn unrelated_codes_are_ignored() {
        let skew = ClockSkew::new();
        let server = local() + Duration::from_secs(3600);
        assert_eq!(
            skew.observe("AccessDenied", &headers_with_date(server), local()),
            None
        );
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(local());
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now_system(), local() + Duration::from_millis(1500));
    }
}

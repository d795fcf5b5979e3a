use std::time::{Duration, SystemTime};

use proptest::prelude::*;
use sdkx::checksum::{self, ChecksumAlgorithm};
use sdkx::retry::{RetryPolicy, RetryTokenBucket};
use sdkx::skew::ClockSkew;

#[derive(Clone, Debug)]
enum BucketOp {
    Acquire(u32),
    Release(u32),
}

fn bucket_op() -> impl Strategy<Value = BucketOp> {
    prop_oneof![
        (0_u32..40).prop_map(BucketOp::Acquire),
        (0_u32..40).prop_map(BucketOp::Release),
    ]
}

fn algorithm() -> impl Strategy<Value = ChecksumAlgorithm> {
    prop::sample::select(ChecksumAlgorithm::VALIDATION_PRIORITY.to_vec())
}

proptest! {
    #[test]
    fn bucket_balance_tracks_acquires_and_releases(
        capacity in 0_u32..200,
        ops in prop::collection::vec(bucket_op(), 0..64),
    ) {
        let bucket = RetryTokenBucket::new(capacity);
        let mut expected = capacity;
        for op in ops {
            match op {
                BucketOp::Acquire(cost) => {
                    let acquired = bucket.try_acquire(cost);
                    prop_assert_eq!(acquired, expected >= cost);
                    expected = if acquired { expected - cost } else { 0 };
                }
                BucketOp::Release(amount) => {
                    expected = expected.saturating_add(amount).min(capacity);
                    prop_assert_eq!(bucket.release(amount), expected);
                }
            }
            prop_assert_eq!(bucket.available(), expected);
            prop_assert!(bucket.available() <= capacity);
        }
    }

    #[test]
    fn backoff_never_decreases_and_respects_the_cap(
        base_ms in 0_u64..2_000,
        max_ms in 0_u64..30_000,
        throttling in any::<bool>(),
    ) {
        let policy = RetryPolicy::standard()
            .base_delay(Duration::from_millis(base_ms))
            .throttling_base_delay(Duration::from_millis(base_ms))
            .max_delay(Duration::from_millis(max_ms));
        let mut previous = Duration::ZERO;
        for attempt in 1..=40 {
            let delay = policy.compute_delay(attempt, throttling);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= Duration::from_millis(max_ms));
            previous = delay;
        }
        prop_assert_eq!(policy.compute_delay(1, throttling), Duration::ZERO);
    }

    #[test]
    fn flipping_any_byte_breaks_the_checksum(
        algorithm in algorithm(),
        data in prop::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
        flip in 1_u8..=255,
    ) {
        let expected = checksum::compute(algorithm, &data).to_base64();
        prop_assert!(checksum::validate_bytes(algorithm, &data, &expected).is_valid());

        let mut corrupted = data.clone();
        let position = index.index(corrupted.len());
        corrupted[position] ^= flip;
        prop_assert!(!checksum::validate_bytes(algorithm, &corrupted, &expected).is_valid());
    }

    #[test]
    fn repeated_skew_samples_are_idempotent(
        local_secs in 1_000_000_000_u64..2_000_000_000,
        drift_secs in -86_400_i64..86_400,
    ) {
        let local = SystemTime::UNIX_EPOCH + Duration::from_secs(local_secs);
        let server = if drift_secs >= 0 {
            local + Duration::from_secs(drift_secs.unsigned_abs())
        } else {
            local - Duration::from_secs(drift_secs.unsigned_abs())
        };
        let skew = ClockSkew::new();
        let first = skew.correct(server, local);
        let second = skew.correct(server, local);
        prop_assert_eq!(first, second);
        prop_assert_eq!(first, drift_secs * 1000);
        prop_assert_eq!(skew.corrected(local), server);
    }
}

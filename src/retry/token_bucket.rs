use std::sync::atomic::{AtomicU32, Ordering};

pub const DEFAULT_RETRY_CAPACITY: u32 = 500;

/// Retry capacity shared by every call of a client (or of several clients
/// holding the same `Arc`). Lock-free; the balance stays in `[0, capacity]`.
#[derive(Debug)]
pub struct RetryTokenBucket {
    capacity: u32,
    balance: AtomicU32,
}

impl RetryTokenBucket {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            balance: AtomicU32::new(capacity),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn available(&self) -> u32 {
        self.balance.load(Ordering::Acquire)
    }

    /// Withdraws `cost`. A balance that cannot cover the cost is drained to
    /// zero and the acquisition fails.
    pub fn try_acquire(&self, cost: u32) -> bool {
        let mut current = self.balance.load(Ordering::Acquire);
        loop {
            let (next, acquired) = if current >= cost {
                (current - cost, true)
            } else {
                (0, false)
            };
            if !acquired && current == 0 {
                return false;
            }
            match self.balance.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return acquired,
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns `amount` to the bucket, capped at capacity. Yields the new balance.
    pub fn release(&self, amount: u32) -> u32 {
        let capacity = self.capacity;
        let previous = self
            .balance
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |balance| {
                Some(balance.saturating_add(amount).min(capacity))
            })
            .unwrap_or_else(|balance| balance);
        previous.saturating_add(amount).min(capacity)
    }
}

impl Default for RetryTokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::RetryTokenBucket;

    #[test]
    fn acquire_and_release_stay_within_bounds() {
        let bucket = RetryTokenBucket::new(500);
        assert!(bucket.try_acquire(5));
        assert_eq!(bucket.available(), 495);
        assert_eq!(bucket.release(1), 496);
        assert_eq!(bucket.release(100), 500);
    }

    #[test]
    fn insufficient_balance_drains_and_fails() {
        let bucket = RetryTokenBucket::new(12);
        assert!(bucket.try_acquire(5));
        assert!(bucket.try_acquire(5));
        assert!(!bucket.try_acquire(5));
        assert_eq!(bucket.available(), 0);
        assert!(!bucket.try_acquire(1));
        assert!(bucket.try_acquire(0));
    }

    #[test]
    fn concurrent_acquires_never_overdraw() {
        let bucket = Arc::new(RetryTokenBucket::new(500));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                std::thread::spawn(move || (0..50).filter(|_| bucket.try_acquire(5)).count())
            })
            .collect();
        let acquired: usize = handles
            .into_iter()
            .map(|handle| handle.join().expect("worker thread"))
            .sum();
        assert_eq!(acquired, 100);
        assert_eq!(bucket.available(), 0);
    }
}

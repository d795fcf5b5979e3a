use std::collections::VecDeque;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use super::{SigningError, derive_signing_key};
use crate::util::lock_unpoisoned;

pub const DEFAULT_KEY_CACHE_CAPACITY: usize = 300;

struct CachedKey {
    id: [u8; 32],
    date: String,
    key: [u8; 32],
}

/// FIFO cache of derived signing keys. A key is reused only while the
/// signing date is unchanged.
pub struct SigningKeyCache {
    capacity: usize,
    entries: Mutex<VecDeque<CachedKey>>,
}

impl SigningKeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn signing_key(
        &self,
        secret: &str,
        date: &str,
        region: &str,
        service: &str,
    ) -> Result<[u8; 32], SigningError> {
        let id = cache_id(secret, region, service);
        let mut entries = lock_unpoisoned(&self.entries);
        if let Some(position) = entries.iter().position(|entry| entry.id == id) {
            if entries[position].date == date {
                return Ok(entries[position].key);
            }
            entries.remove(position);
        }

        let key = derive_signing_key(secret, date, region, service)?;
        entries.push_back(CachedKey {
            id,
            date: date.to_owned(),
            key,
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        Ok(key)
    }
}

impl Default for SigningKeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for SigningKeyCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SigningKeyCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

fn cache_id(secret: &str, region: &str, service: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b"\n");
    hasher.update(region.as_bytes());
    hasher.update(b"\n");
    hasher.update(service.as_bytes());
    hasher.finalize().into()
}

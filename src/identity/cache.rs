use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{BlockingIdentityResolver, IdentityError, IdentityResolver, SigningIdentity};
use crate::context::ExecutionAttributes;
use crate::skew::{Clock, SystemClock};
use crate::util::lock_unpoisoned;

pub const DEFAULT_REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Caches the identity of the wrapped resolver and refreshes it shortly
/// before it expires. Concurrent refreshes share one fetch.
pub struct CachingIdentityResolver<R> {
    inner: R,
    clock: Arc<dyn Clock>,
    refresh_window: Duration,
    cached: RwLock<Option<Arc<SigningIdentity>>>,
    async_refresh: tokio::sync::Mutex<()>,
    blocking_refresh: Mutex<()>,
    fetches: AtomicU64,
}

impl<R> CachingIdentityResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            clock: Arc::new(SystemClock),
            refresh_window: DEFAULT_REFRESH_WINDOW,
            cached: RwLock::new(None),
            async_refresh: tokio::sync::Mutex::new(()),
            blocking_refresh: Mutex::new(()),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn refresh_window(mut self, refresh_window: Duration) -> Self {
        self.refresh_window = refresh_window;
        self
    }

    /// How many times the wrapped resolver has been called.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        *self.write_slot() = None;
    }

    fn read_slot(&self) -> Option<Arc<SigningIdentity>> {
        match self.cached.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<SigningIdentity>>> {
        match self.cached.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fresh(&self) -> Option<Arc<SigningIdentity>> {
        let identity = self.read_slot()?;
        let Some(expiry) = identity.expiry() else {
            return Some(identity);
        };
        let refresh_at = expiry
            .checked_sub(self.refresh_window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        (self.clock.now_system() < refresh_at).then_some(identity)
    }

    /// A cached identity that is due for refresh but has not yet expired.
    fn unexpired(&self) -> Option<Arc<SigningIdentity>> {
        let identity = self.read_slot()?;
        match identity.expiry() {
            Some(expiry) if self.clock.now_system() >= expiry => None,
            _ => Some(identity),
        }
    }

    fn store(&self, identity: SigningIdentity) -> SigningIdentity {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let cached = Arc::new(identity);
        *self.write_slot() = Some(Arc::clone(&cached));
        debug!(
            expiry = ?cached.expiry(),
            "cached refreshed signing identity"
        );
        (*cached).clone()
    }

    fn fallback(&self, error: IdentityError, provider: &'static str) -> Result<SigningIdentity, IdentityError> {
        match self.unexpired() {
            Some(identity) => {
                warn!(
                    provider,
                    error = %error,
                    "identity refresh failed; using cached identity until it expires"
                );
                Ok((*identity).clone())
            }
            None => Err(error),
        }
    }
}

#[async_trait]
impl<R> IdentityResolver for CachingIdentityResolver<R>
where
    R: IdentityResolver,
{
    async fn resolve(&self, attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        if let Some(identity) = self.fresh() {
            return Ok((*identity).clone());
        }

        let _refresh = self.async_refresh.lock().await;
        if let Some(identity) = self.fresh() {
            return Ok((*identity).clone());
        }

        match self.inner.resolve(attributes).await {
            Ok(identity) => Ok(self.store(identity)),
            Err(error) => self.fallback(error, self.inner.name()),
        }
    }

    fn invalidate(&self) {
        self.clear();
        self.inner.invalidate();
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

impl<R> BlockingIdentityResolver for CachingIdentityResolver<R>
where
    R: BlockingIdentityResolver,
{
    fn resolve(&self, attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        if let Some(identity) = self.fresh() {
            return Ok((*identity).clone());
        }

        let _refresh = lock_unpoisoned(&self.blocking_refresh);
        if let Some(identity) = self.fresh() {
            return Ok((*identity).clone());
        }

        match self.inner.resolve(attributes) {
            Ok(identity) => Ok(self.store(identity)),
            Err(error) => self.fallback(error, self.inner.name()),
        }
    }

    fn invalidate(&self) {
        self.clear();
        self.inner.invalidate();
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

//! Signing identities and the resolvers that produce them.

mod cache;
mod chain;
mod container;
mod env;
mod profile;

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;

pub use cache::{CachingIdentityResolver, DEFAULT_REFRESH_WINDOW};
pub use chain::IdentityResolverChain;
pub use container::{ContainerIdentityResolver, ContainerResolverPolicy};
pub use env::EnvironmentIdentityResolver;
pub use profile::ProfileIdentityResolver;

use crate::context::ExecutionAttributes;
use crate::error::BoxError;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    expiry: Option<SystemTime>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expiry: None,
        }
    }

    pub fn session_token(mut self, session_token: impl Into<String>) -> Self {
        self.session_token = Some(session_token.into());
        self
    }

    pub fn expiry(mut self, expiry: SystemTime) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn configured_session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn configured_expiry(&self) -> Option<SystemTime> {
        self.expiry
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expiry", &self.expiry)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    token: String,
    expiry: Option<SystemTime>,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expiry: None,
        }
    }

    pub fn expiry(mut self, expiry: SystemTime) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BearerToken")
            .field("token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Resolved credential material; immutable once produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SigningIdentity {
    Credentials(Credentials),
    Token(BearerToken),
}

impl SigningIdentity {
    pub fn expiry(&self) -> Option<SystemTime> {
        match self {
            Self::Credentials(credentials) => credentials.expiry,
            Self::Token(token) => token.expiry,
        }
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        match self {
            Self::Credentials(credentials) => Some(credentials),
            Self::Token(_) => None,
        }
    }
}

impl From<Credentials> for SigningIdentity {
    fn from(credentials: Credentials) -> Self {
        Self::Credentials(credentials)
    }
}

impl From<BearerToken> for SigningIdentity {
    fn from(token: BearerToken) -> Self {
        Self::Token(token)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    #[error("{provider}: {message}")]
    Missing {
        provider: &'static str,
        message: String,
    },
    #[error("{provider}: fetching credentials failed after {attempts} attempts: {source}")]
    Fetch {
        provider: &'static str,
        attempts: u32,
        #[source]
        source: BoxError,
    },
    #[error("{provider}: invalid credentials response: {message}")]
    InvalidResponse {
        provider: &'static str,
        message: String,
    },
    #[error("no identity resolver in the chain succeeded: {}", failures.join("; "))]
    Chain { failures: Vec<String> },
}

/// Produces the identity used to sign one attempt.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError>;

    /// Drops any cached identity so the next attempt resolves afresh.
    fn invalidate(&self) {}

    fn name(&self) -> &'static str {
        "custom"
    }
}

pub trait BlockingIdentityResolver: Send + Sync {
    fn resolve(&self, attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError>;

    fn invalidate(&self) {}

    fn name(&self) -> &'static str {
        "custom"
    }
}

#[async_trait]
impl<T> IdentityResolver for Arc<T>
where
    T: IdentityResolver + ?Sized,
{
    async fn resolve(&self, attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        (**self).resolve(attributes).await
    }

    fn invalidate(&self) {
        (**self).invalidate();
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

impl<T> BlockingIdentityResolver for Arc<T>
where
    T: BlockingIdentityResolver + ?Sized,
{
    fn resolve(&self, attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        (**self).resolve(attributes)
    }

    fn invalidate(&self) {
        (**self).invalidate();
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Always returns the same identity.
#[derive(Clone, Debug)]
pub struct StaticIdentityResolver {
    identity: SigningIdentity,
}

impl StaticIdentityResolver {
    pub fn new(identity: impl Into<SigningIdentity>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve(&self, _attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        Ok(self.identity.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

impl BlockingIdentityResolver for StaticIdentityResolver {
    fn resolve(&self, _attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        Ok(self.identity.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

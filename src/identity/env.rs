use std::sync::Arc;

use async_trait::async_trait;

use super::{BlockingIdentityResolver, Credentials, IdentityError, IdentityResolver, SigningIdentity};
use crate::context::ExecutionAttributes;

const PROVIDER: &str = "environment";

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the optional
/// `AWS_SESSION_TOKEN`.
#[derive(Clone)]
pub struct EnvironmentIdentityResolver {
    lookup: Lookup,
}

impl EnvironmentIdentityResolver {
    pub fn new() -> Self {
        Self {
            lookup: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Reads variables through `lookup` instead of the process environment.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|value| !value.trim().is_empty())
    }

    fn load(&self) -> Result<SigningIdentity, IdentityError> {
        let missing = |name: &str| IdentityError::Missing {
            provider: PROVIDER,
            message: format!("{name} is not set"),
        };
        let access_key_id = self
            .var("AWS_ACCESS_KEY_ID")
            .ok_or_else(|| missing("AWS_ACCESS_KEY_ID"))?;
        let secret_access_key = self
            .var("AWS_SECRET_ACCESS_KEY")
            .ok_or_else(|| missing("AWS_SECRET_ACCESS_KEY"))?;

        let mut credentials = Credentials::new(access_key_id, secret_access_key);
        if let Some(session_token) = self.var("AWS_SESSION_TOKEN") {
            credentials = credentials.session_token(session_token);
        }
        Ok(credentials.into())
    }
}

impl Default for EnvironmentIdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EnvironmentIdentityResolver {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("EnvironmentIdentityResolver").finish()
    }
}

#[async_trait]
impl IdentityResolver for EnvironmentIdentityResolver {
    async fn resolve(&self, _attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        self.load()
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

impl BlockingIdentityResolver for EnvironmentIdentityResolver {
    fn resolve(&self, _attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        self.load()
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

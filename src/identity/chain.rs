use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{BlockingIdentityResolver, IdentityError, IdentityResolver, SigningIdentity};
use crate::context::ExecutionAttributes;

const NONE_YET: usize = usize::MAX;

/// Tries each resolver in order; the first success wins and is tried first on
/// later calls.
pub struct IdentityResolverChain<R> {
    resolvers: Vec<R>,
    last_success: AtomicUsize,
}

impl<R> IdentityResolverChain<R> {
    pub fn new(resolvers: impl IntoIterator<Item = R>) -> Self {
        Self {
            resolvers: resolvers.into_iter().collect(),
            last_success: AtomicUsize::new(NONE_YET),
        }
    }

    pub fn push(mut self, resolver: R) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    fn order(&self) -> Vec<usize> {
        let last = self.last_success.load(Ordering::Relaxed);
        let mut order = Vec::with_capacity(self.resolvers.len());
        if last < self.resolvers.len() {
            order.push(last);
        }
        order.extend((0..self.resolvers.len()).filter(|index| *index != last));
        order
    }

    fn remember(&self, index: usize, provider: &'static str) {
        self.last_success.store(index, Ordering::Relaxed);
        debug!(provider, "identity resolved by chain member");
    }
}

#[async_trait]
impl<R> IdentityResolver for IdentityResolverChain<R>
where
    R: IdentityResolver,
{
    async fn resolve(&self, attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        let mut failures = Vec::new();
        for index in self.order() {
            let resolver = &self.resolvers[index];
            match resolver.resolve(attributes).await {
                Ok(identity) => {
                    self.remember(index, resolver.name());
                    return Ok(identity);
                }
                Err(error) => failures.push(error.to_string()),
            }
        }
        Err(IdentityError::Chain { failures })
    }

    fn invalidate(&self) {
        for resolver in &self.resolvers {
            resolver.invalidate();
        }
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

impl<R> BlockingIdentityResolver for IdentityResolverChain<R>
where
    R: BlockingIdentityResolver,
{
    fn resolve(&self, attributes: &ExecutionAttributes) -> Result<SigningIdentity, IdentityError> {
        let mut failures = Vec::new();
        for index in self.order() {
            let resolver = &self.resolvers[index];
            match resolver.resolve(attributes) {
                Ok(identity) => {
                    self.remember(index, resolver.name());
                    return Ok(identity);
                }
                Err(error) => failures.push(error.to_string()),
            }
        }
        Err(IdentityError::Chain { failures })
    }

    fn invalidate(&self) {
        for resolver in &self.resolvers {
            resolver.invalidate();
        }
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::IdentityResolverChain;
    use crate::context::ExecutionAttributes;
    use crate::identity::{
        BlockingIdentityResolver, Credentials, EnvironmentIdentityResolver, IdentityError,
        IdentityResolver, StaticIdentityResolver,
    };

    #[tokio::test]
    async fn falls_through_to_first_successful_resolver() {
        let chain: IdentityResolverChain<Arc<dyn IdentityResolver>> = IdentityResolverChain::new([
            Arc::new(EnvironmentIdentityResolver::with_lookup(|_| None)) as Arc<dyn IdentityResolver>,
            Arc::new(StaticIdentityResolver::new(Credentials::new("AKID", "secret"))),
        ]);
        let identity = IdentityResolver::resolve(&chain, &ExecutionAttributes::new())
            .await
            .expect("static resolver succeeds");
        assert_eq!(
            identity.credentials().map(Credentials::access_key_id),
            Some("AKID")
        );
        assert_eq!(chain.order(), vec![1, 0]);
    }

    #[test]
    fn all_failures_are_listed() {
        let chain = IdentityResolverChain::new([
            EnvironmentIdentityResolver::with_lookup(|_| None),
            EnvironmentIdentityResolver::with_lookup(|name| {
                (name == "AWS_ACCESS_KEY_ID").then(|| "AKID".to_owned())
            }),
        ]);
        let error = BlockingIdentityResolver::resolve(&chain, &ExecutionAttributes::new())
            .expect_err("every member fails");
        match error {
            IdentityError::Chain { failures } => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].contains("AWS_ACCESS_KEY_ID"));
                assert!(failures[1].contains("AWS_SECRET_ACCESS_KEY"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

//! SDK configuration and client cache
//!
//! Every folder or parameter may name a role to assume. Clients are built
//! lazily, once per distinct [`CredentialOverride`], and shared afterwards.
//! Calls without an override use the ambient credential chain.

use aws_config::retry::RetryConfig;
use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::config::{Credentials, SharedCredentialsProvider};
use dashmap::DashMap;
use tracing::{debug, info};

use autosync_core::domain::folder::CredentialOverride;

/// Region used when the endpoint configuration does not name one
const ENDPOINT_REGION: &str = "us-east-1";

/// Ambient configuration: environment, profile, instance metadata
///
/// SDK retries are disabled; callers own the retry policy.
pub async fn environment_config() -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .retry_config(RetryConfig::disabled())
        .load()
        .await
}

/// Configuration for an S3/SSM compatible endpoint with static keys
pub async fn endpoint_config(
    endpoint_url: &str,
    access_key_id: &str,
    secret_access_key: &str,
) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(ENDPOINT_REGION))
        .endpoint_url(endpoint_url)
        .credentials_provider(Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "autosync-static",
        ))
        .retry_config(RetryConfig::disabled())
        .load()
        .await
}

type ClientFactory<C> = Box<dyn Fn(&SdkConfig) -> C + Send + Sync>;

/// Lazily built SDK clients keyed by credential override
pub struct ClientCache<C> {
    base: SdkConfig,
    clients: DashMap<Option<CredentialOverride>, C>,
    factory: ClientFactory<C>,
}

impl<C: Clone> ClientCache<C> {
    pub fn new(base: SdkConfig, factory: impl Fn(&SdkConfig) -> C + Send + Sync + 'static) -> Self {
        Self {
            base,
            clients: DashMap::new(),
            factory: Box::new(factory),
        }
    }

    /// Client for `credentials`, building it on first use
    pub async fn client(&self, credentials: Option<&CredentialOverride>) -> C {
        let key = credentials.cloned();
        if let Some(client) = self.clients.get(&key) {
            return client.value().clone();
        }

        let config = match credentials {
            None => self.base.clone(),
            Some(role) => assumed_role_config(&self.base, role).await,
        };
        let client = (self.factory)(&config);
        // A concurrent caller may have won the race; keep the first client.
        self.clients.entry(key).or_insert(client).value().clone()
    }

    /// Number of distinct credential contexts seen so far
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

async fn assumed_role_config(base: &SdkConfig, role: &CredentialOverride) -> SdkConfig {
    info!(
        role_arn = %role.role_arn,
        session_name = %role.session_name,
        "Configuring assumed-role credentials"
    );
    let mut builder = AssumeRoleProvider::builder(role.role_arn.clone())
        .session_name(role.session_name.clone())
        .configure(base);
    if let Some(external_id) = &role.external_id {
        debug!("Using external id for role assumption");
        builder = builder.external_id(external_id.clone());
    }
    let provider = builder.build().await;

    base.to_builder()
        .credentials_provider(SharedCredentialsProvider::new(provider))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_default_client_built_once() {
        let base = endpoint_config("http://127.0.0.1:1", "k", "s").await;
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let cache = ClientCache::new(base, move |_config: &SdkConfig| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.client(None).await;
        cache.client(None).await;
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_each_role_gets_its_own_client() {
        let base = endpoint_config("http://127.0.0.1:1", "k", "s").await;
        let cache = ClientCache::new(base, |config: &SdkConfig| {
            config.endpoint_url().map(str::to_string)
        });
        let role = |arn: &str| CredentialOverride {
            role_arn: arn.into(),
            session_name: "test".into(),
            external_id: None,
        };

        let a = cache.client(Some(&role("arn:aws:iam::1:role/a"))).await;
        cache.client(Some(&role("arn:aws:iam::1:role/b"))).await;
        cache.client(Some(&role("arn:aws:iam::1:role/a"))).await;
        cache.client(None).await;

        assert_eq!(a.as_deref(), Some("http://127.0.0.1:1"));
        assert_eq!(cache.len(), 3);
    }
}

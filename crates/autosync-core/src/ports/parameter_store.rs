//! Parameter store port

use crate::domain::errors::StoreError;
use crate::domain::folder::CredentialOverride;

/// Plain string key/value store
#[async_trait::async_trait]
pub trait ParameterStore: Send + Sync {
    /// Writes `value` under `name`, replacing any previous value
    async fn put(
        &self,
        name: &str,
        value: &str,
        credentials: Option<&CredentialOverride>,
    ) -> Result<(), StoreError>;

    /// Reads `name`; `Ok(None)` when it does not exist
    async fn get(
        &self,
        name: &str,
        credentials: Option<&CredentialOverride>,
    ) -> Result<Option<String>, StoreError>;
}

//! SSM Parameter Store implementation of [`ParameterStore`]

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ssm::types::ParameterType;
use aws_sdk_ssm::Client;
use tracing::{debug, instrument};

use autosync_core::domain::errors::StoreError;
use autosync_core::domain::folder::CredentialOverride;
use autosync_core::ports::ParameterStore;

use crate::clients::{environment_config, ClientCache};
use crate::error::classify_sdk_error;

/// Writes plain `String` parameters, overwriting previous values
pub struct SsmParameterStore {
    clients: ClientCache<Client>,
}

impl SsmParameterStore {
    pub async fn from_environment() -> Self {
        Self::new(environment_config().await)
    }

    pub fn new(config: SdkConfig) -> Self {
        Self {
            clients: ClientCache::new(config, Client::new),
        }
    }
}

#[async_trait]
impl ParameterStore for SsmParameterStore {
    #[instrument(skip(self, value, credentials))]
    async fn put(
        &self,
        name: &str,
        value: &str,
        credentials: Option<&CredentialOverride>,
    ) -> Result<(), StoreError> {
        let client = self.clients.client(credentials).await;
        let output = client
            .put_parameter()
            .name(name)
            .value(value)
            .r#type(ParameterType::String)
            .overwrite(true)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        debug!(version = output.version(), "Parameter written");
        Ok(())
    }

    #[instrument(skip(self, credentials))]
    async fn get(
        &self,
        name: &str,
        credentials: Option<&CredentialOverride>,
    ) -> Result<Option<String>, StoreError> {
        let client = self.clients.client(credentials).await;
        match client.get_parameter().name(name).send().await {
            Ok(output) => Ok(output
                .parameter()
                .and_then(|parameter| parameter.value())
                .map(str::to_string)),
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .is_some_and(|service| service.is_parameter_not_found());
                if not_found {
                    Ok(None)
                } else {
                    Err(classify_sdk_error(err))
                }
            }
        }
    }
}

//! [`KmsClient`] implementation backed by AWS KMS.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_kms::{
    error::DisplayErrorContext,
    primitives::Blob,
    types::{DataKeySpec, KeyUsageType},
};
use phi_common::KmsContext;
use tracing::{debug, warn};

use crate::kms::{GeneratedDataKey, KmsClient, KmsError};

/// Waiting period before KMS deletes a master key that lost the alias race.
const ORPHAN_DELETION_WINDOW_DAYS: i32 = 7;

/// AWS KMS-backed key service.
#[derive(Clone, Debug)]
pub struct AwsKms {
    client: aws_sdk_kms::Client,
}

impl AwsKms {
    pub fn new(client: aws_sdk_kms::Client) -> Self {
        Self { client }
    }

    /// Schedule deletion of a key whose alias could not be created.
    async fn discard_key(&self, key_id: &str) {
        let result = self
            .client
            .schedule_key_deletion()
            .key_id(key_id)
            .pending_window_in_days(ORPHAN_DELETION_WINDOW_DAYS)
            .send()
            .await;
        match result {
            Ok(_) => debug!(%key_id, "unaliased master key scheduled for deletion"),
            Err(e) => warn!(
                %key_id,
                error = %DisplayErrorContext(&e),
                "failed to schedule deletion of unaliased master key"
            ),
        }
    }
}

fn to_sdk_context(context: &KmsContext) -> HashMap<String, String> {
    context.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn service_error<E>(e: E) -> KmsError
where
    E: std::error::Error + 'static,
{
    KmsError::Service(DisplayErrorContext(&e).to_string())
}

#[async_trait]
impl KmsClient for AwsKms {
    async fn find_key_by_alias(&self, alias: &str) -> Result<Option<String>, KmsError> {
        match self.client.describe_key().key_id(alias).send().await {
            Ok(out) => Ok(out.key_metadata().map(|m| m.key_id().to_owned())),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found_exception()) => {
                Ok(None)
            }
            Err(e) => Err(service_error(e)),
        }
    }

    async fn create_key(&self, alias: &str, description: &str) -> Result<String, KmsError> {
        let created = self
            .client
            .create_key()
            .description(description)
            .key_usage(KeyUsageType::EncryptDecrypt)
            .send()
            .await
            .map_err(service_error)?;

        let key_id = created
            .key_metadata()
            .map(|m| m.key_id().to_owned())
            .ok_or_else(|| KmsError::Service("CreateKey response contained no key metadata".into()))?;

        match self
            .client
            .create_alias()
            .alias_name(alias)
            .target_key_id(&key_id)
            .send()
            .await
        {
            Ok(_) => {
                debug!(%alias, %key_id, "kms alias created");
                Ok(key_id)
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_already_exists_exception()) => {
                // A concurrent provisioner owns the alias.
                self.discard_key(&key_id).await;
                Err(KmsError::AliasExists(alias.to_owned()))
            }
            Err(e) => {
                self.discard_key(&key_id).await;
                Err(service_error(e))
            }
        }
    }

    async fn generate_data_key(
        &self,
        key_id: &str,
        context: &KmsContext,
    ) -> Result<GeneratedDataKey, KmsError> {
        let out = self
            .client
            .generate_data_key()
            .key_id(key_id)
            .key_spec(DataKeySpec::Aes256)
            .set_encryption_context(Some(to_sdk_context(context)))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_not_found_exception()) {
                    KmsError::NotFound(key_id.to_owned())
                } else {
                    service_error(e)
                }
            })?;

        let plaintext = out
            .plaintext()
            .ok_or_else(|| KmsError::Service("GenerateDataKey response contained no plaintext".into()))?
            .as_ref()
            .to_vec();
        let wrapped = out
            .ciphertext_blob()
            .ok_or_else(|| {
                KmsError::Service("GenerateDataKey response contained no ciphertext blob".into())
            })?
            .as_ref()
            .to_vec();

        Ok(GeneratedDataKey { plaintext, wrapped })
    }

    async fn decrypt(
        &self,
        key_id: &str,
        wrapped: &[u8],
        context: &KmsContext,
    ) -> Result<Vec<u8>, KmsError> {
        let out = self
            .client
            .decrypt()
            .key_id(key_id)
            .ciphertext_blob(Blob::new(wrapped.to_vec()))
            .set_encryption_context(Some(to_sdk_context(context)))
            .send()
            .await
            .map_err(|e| {
                let refused = e.as_service_error().is_some_and(|se| {
                    se.is_invalid_ciphertext_exception() || se.is_incorrect_key_exception()
                });
                let missing = e
                    .as_service_error()
                    .is_some_and(|se| se.is_not_found_exception());
                if refused {
                    KmsError::InvalidCiphertext(DisplayErrorContext(&e).to_string())
                } else if missing {
                    KmsError::NotFound(key_id.to_owned())
                } else {
                    service_error(e)
                }
            })?;

        out.plaintext()
            .map(|p| p.as_ref().to_vec())
            .ok_or_else(|| KmsError::Service("Decrypt response contained no plaintext".into()))
    }
}

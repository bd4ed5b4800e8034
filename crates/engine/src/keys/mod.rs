//! Master key resolution and per-operation data keys (envelope encryption).
//!
//! # Lifecycle
//!
//! 1. [`KeyProvider::resolve_master_key`] looks up `alias/<prefix>-<environment>`
//!    and provisions the key if the alias does not exist. The handle is cached
//!    per environment for the life of the provider.
//! 2. Every encryption asks for a fresh data key via
//!    [`KeyProvider::generate_data_key`]; every decryption unwraps the stored
//!    one via [`KeyProvider::unwrap_data_key`]. Both pass the encryption
//!    context to the KMS as its authorization context.
//!
//! # Security invariants
//!
//! - Plaintext data keys are **never** persisted, logged, or included in traces.
//! - Transient KMS errors are propagated for the caller to retry; nothing is
//!   retried or swallowed here.

pub mod store;

pub use store::{DataKey, KeyBytes, KeyHandle, MasterKeyCache};

use std::sync::Arc;

use phi_common::{EncryptionContext, EngineError, KmsContext};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::kms::{KmsClient, KmsError};

/// Default prefix for per-environment master key aliases.
pub const DEFAULT_ALIAS_PREFIX: &str = "phi-field-encryption";

/// Resolves master keys and issues data keys through a [`KmsClient`].
#[derive(Clone)]
pub struct KeyProvider {
    kms: Arc<dyn KmsClient>,
    alias_prefix: String,
    cache: MasterKeyCache,
}

impl KeyProvider {
    pub fn new(kms: Arc<dyn KmsClient>, alias_prefix: impl Into<String>) -> Self {
        Self {
            kms,
            alias_prefix: alias_prefix.into(),
            cache: MasterKeyCache::new(),
        }
    }

    /// Alias under which the master key for `environment` lives.
    pub fn alias_for(&self, environment: &str) -> String {
        format!("alias/{}-{}", self.alias_prefix, environment)
    }

    /// Resolve (or provision, once) the master key for `environment`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::KeyUnavailable`] if the key is absent and cannot
    /// be provisioned, or [`EngineError::Kms`] on a transient KMS failure.
    pub async fn resolve_master_key(&self, environment: &str) -> Result<KeyHandle, EngineError> {
        if environment.trim().is_empty() {
            return Err(EngineError::InvalidInput("environment must not be empty".into()));
        }
        let alias = self.alias_for(environment);
        self.cache
            .get_or_try_init(environment, || self.resolve_or_provision(alias, environment))
            .await
    }

    async fn resolve_or_provision(
        &self,
        alias: String,
        environment: &str,
    ) -> Result<KeyHandle, EngineError> {
        let handle = |key_id: String| KeyHandle {
            key_id,
            alias: alias.clone(),
            environment: environment.to_owned(),
        };

        if let Some(key_id) = self.kms.find_key_by_alias(&alias).await? {
            debug!(%alias, %key_id, "master key resolved");
            return Ok(handle(key_id));
        }

        let description = format!("PHI field encryption master key ({environment})");
        match self.kms.create_key(&alias, &description).await {
            Ok(key_id) => {
                info!(%alias, %key_id, "master key provisioned");
                Ok(handle(key_id))
            }
            // Another process provisioned it between our lookup and create.
            Err(KmsError::AliasExists(_)) => {
                warn!(%alias, "alias created concurrently; re-resolving");
                match self.kms.find_key_by_alias(&alias).await? {
                    Some(key_id) => Ok(handle(key_id)),
                    None => Err(EngineError::KeyUnavailable(alias.clone())),
                }
            }
            Err(e) => Err(EngineError::KeyUnavailable(format!(
                "cannot provision {alias}: {e}"
            ))),
        }
    }

    /// Generate a fresh data key under `master`, bound to `context`.
    ///
    /// # Errors
    ///
    /// Propagates KMS failures; rejects key material of the wrong length.
    pub async fn generate_data_key(
        &self,
        master: &KeyHandle,
        context: &EncryptionContext,
    ) -> Result<DataKey, EngineError> {
        let mut generated = self
            .kms
            .generate_data_key(&master.key_id, &context.to_kms_context())
            .await?;
        let key = KeyBytes::from_slice(&generated.plaintext)?;
        Ok(DataKey {
            key,
            wrapped: std::mem::take(&mut generated.wrapped),
        })
    }

    /// Unwrap a stored data key. The KMS refuses if `context` differs from the
    /// one supplied at generation time.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AuthenticationFailure`] on a context or key
    /// mismatch, [`EngineError::Kms`] on a transient failure.
    pub async fn unwrap_data_key(
        &self,
        key_id: &str,
        wrapped: &[u8],
        context: &KmsContext,
    ) -> Result<KeyBytes, EngineError> {
        let mut plaintext = self.kms.decrypt(key_id, wrapped, context).await?;
        let key = KeyBytes::from_slice(&plaintext);
        plaintext.zeroize();
        key
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &MasterKeyCache {
        &self.cache
    }
}

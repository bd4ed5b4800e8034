//! In-process KMS for development and tests.
//!
//! Master keys live only in memory. Data keys are wrapped with AES-256-GCM-SIV
//! under the master key, with the key ID and canonical encryption context as
//! AAD, so unwrapping under a different context is refused the same way AWS
//! KMS refuses it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use phi_common::KmsContext;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{GeneratedDataKey, KmsClient, KmsError};
use crate::crypto::cipher::{self, Sealed, NONCE_LEN, TAG_LEN};
use crate::keys::KeyBytes;

#[derive(Default)]
struct LocalState {
    keys: HashMap<String, KeyBytes>,
    aliases: HashMap<String, String>,
}

/// Memory-only [`KmsClient`].
#[derive(Default)]
pub struct LocalKms {
    state: RwLock<LocalState>,
    keys_created: AtomicUsize,
}

impl LocalKms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of master keys created so far.
    pub fn keys_created(&self) -> usize {
        self.keys_created.load(Ordering::SeqCst)
    }
}

fn wrap_aad(key_id: &str, context: &KmsContext) -> Vec<u8> {
    let mut aad = key_id.as_bytes().to_vec();
    aad.push(0);
    aad.extend_from_slice(&serde_json::to_vec(context).unwrap_or_default());
    aad
}

#[async_trait]
impl KmsClient for LocalKms {
    async fn find_key_by_alias(&self, alias: &str) -> Result<Option<String>, KmsError> {
        Ok(self.state.read().await.aliases.get(alias).cloned())
    }

    async fn create_key(&self, alias: &str, _description: &str) -> Result<String, KmsError> {
        let mut state = self.state.write().await;
        if state.aliases.contains_key(alias) {
            return Err(KmsError::AliasExists(alias.to_owned()));
        }
        let key_id = Uuid::new_v4().to_string();
        state.keys.insert(key_id.clone(), KeyBytes(cipher::random_key()));
        state.aliases.insert(alias.to_owned(), key_id.clone());
        self.keys_created.fetch_add(1, Ordering::SeqCst);
        debug!(%alias, %key_id, "local master key created");
        Ok(key_id)
    }

    async fn generate_data_key(
        &self,
        key_id: &str,
        context: &KmsContext,
    ) -> Result<GeneratedDataKey, KmsError> {
        let state = self.state.read().await;
        let master = state
            .keys
            .get(key_id)
            .ok_or_else(|| KmsError::NotFound(key_id.to_owned()))?;

        let data_key = KeyBytes(cipher::random_key());
        let sealed = cipher::seal(&data_key.0[..], &master.0[..], &wrap_aad(key_id, context))
            .map_err(|e| KmsError::Service(e.to_string()))?;

        let mut wrapped = Vec::with_capacity(NONCE_LEN + TAG_LEN + sealed.ciphertext.len());
        wrapped.extend_from_slice(&sealed.nonce);
        wrapped.extend_from_slice(&sealed.tag);
        wrapped.extend_from_slice(&sealed.ciphertext);

        Ok(GeneratedDataKey {
            plaintext: data_key.0.to_vec(),
            wrapped,
        })
    }

    async fn decrypt(
        &self,
        key_id: &str,
        wrapped: &[u8],
        context: &KmsContext,
    ) -> Result<Vec<u8>, KmsError> {
        let state = self.state.read().await;
        let master = state
            .keys
            .get(key_id)
            .ok_or_else(|| KmsError::NotFound(key_id.to_owned()))?;

        if wrapped.len() <= NONCE_LEN + TAG_LEN {
            return Err(KmsError::InvalidCiphertext("wrapped key too short".into()));
        }
        let (nonce, rest) = wrapped.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        let sealed = Sealed {
            nonce: nonce.try_into().map_err(|_| KmsError::InvalidCiphertext("nonce".into()))?,
            tag: tag.try_into().map_err(|_| KmsError::InvalidCiphertext("tag".into()))?,
            ciphertext: ciphertext.to_vec(),
        };

        cipher::open(&sealed, &master.0[..], &wrap_aad(key_id, context))
            .map_err(|_| KmsError::InvalidCiphertext("encryption context or key mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(clinic: &str) -> KmsContext {
        let mut c = KmsContext::new();
        c.insert("clinicId".into(), clinic.into());
        c.insert("fieldType".into(), "ssn".into());
        c
    }

    #[tokio::test]
    async fn alias_lookup_after_create() {
        let kms = LocalKms::new();
        assert_eq!(kms.find_key_by_alias("alias/a").await.unwrap(), None);
        let id = kms.create_key("alias/a", "test").await.unwrap();
        assert_eq!(kms.find_key_by_alias("alias/a").await.unwrap(), Some(id));
        assert_eq!(kms.keys_created(), 1);
    }

    #[tokio::test]
    async fn duplicate_alias_rejected() {
        let kms = LocalKms::new();
        kms.create_key("alias/a", "test").await.unwrap();
        assert!(matches!(
            kms.create_key("alias/a", "test").await,
            Err(KmsError::AliasExists(_))
        ));
    }

    #[tokio::test]
    async fn wrap_unwrap_round_trip() {
        let kms = LocalKms::new();
        let id = kms.create_key("alias/a", "test").await.unwrap();
        let dk = kms.generate_data_key(&id, &ctx("c1")).await.unwrap();
        assert_eq!(dk.plaintext.len(), cipher::KEY_LEN);
        let unwrapped = kms.decrypt(&id, &dk.wrapped, &ctx("c1")).await.unwrap();
        assert_eq!(unwrapped, dk.plaintext);
    }

    #[tokio::test]
    async fn context_mismatch_refused() {
        let kms = LocalKms::new();
        let id = kms.create_key("alias/a", "test").await.unwrap();
        let dk = kms.generate_data_key(&id, &ctx("c1")).await.unwrap();
        assert!(matches!(
            kms.decrypt(&id, &dk.wrapped, &ctx("c2")).await,
            Err(KmsError::InvalidCiphertext(_))
        ));
    }

    #[tokio::test]
    async fn unknown_key_not_found() {
        let kms = LocalKms::new();
        assert!(matches!(
            kms.generate_data_key("missing", &ctx("c1")).await,
            Err(KmsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn truncated_wrapped_key_refused() {
        let kms = LocalKms::new();
        let id = kms.create_key("alias/a", "test").await.unwrap();
        assert!(matches!(
            kms.decrypt(&id, &[0u8; 10], &ctx("c1")).await,
            Err(KmsError::InvalidCiphertext(_))
        ));
    }
}

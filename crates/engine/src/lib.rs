//! PHI field encryption engine.
//!
//! Envelope-encrypts individual fields under KMS-issued data keys, binds each
//! ciphertext to its encryption context, derives salted deterministic hashes
//! for duplicate detection, and produces encrypted search token sets.
//!
//! [`PhiEngine`] wires the pieces together from a [`Config`]; each component
//! can also be constructed directly with an explicit [`KmsClient`].

pub mod aws;
pub mod batch;
pub mod config;
pub mod crypto;
pub mod field;
pub mod hash;
pub mod keys;
pub mod kms;
pub mod search;
pub mod telemetry;

use std::collections::HashMap;
use std::sync::Arc;

use phi_common::{EncryptedField, EncryptionContext, EngineError, FieldInput};
use tracing::info;

pub use batch::{BatchCodec, FieldOutcome};
pub use config::{Config, KmsBackend};
pub use field::FieldCipher;
pub use hash::{DeterministicHasher, HashKey};
pub use keys::{KeyHandle, KeyProvider};
pub use kms::KmsClient;
pub use search::SearchTokenizer;

use crypto::Compressor;

/// All engine components for one environment, sharing one [`KeyProvider`].
#[derive(Clone)]
pub struct PhiEngine {
    environment: String,
    cipher: FieldCipher,
    hasher: DeterministicHasher,
    tokenizer: SearchTokenizer,
    batch: BatchCodec,
}

impl PhiEngine {
    /// Assemble an engine over `kms`.
    pub fn new(
        kms: Arc<dyn KmsClient>,
        hash_key: HashKey,
        environment: impl Into<String>,
        alias_prefix: impl Into<String>,
        compressor: Compressor,
    ) -> Self {
        let environment = environment.into();
        let keys = Arc::new(KeyProvider::new(kms, alias_prefix));
        let cipher = FieldCipher::new(keys, compressor, environment.clone());
        let hasher = DeterministicHasher::new(hash_key, environment.clone());
        let tokenizer = SearchTokenizer::new(cipher.clone(), hasher.clone());
        let batch = BatchCodec::new(cipher.clone());
        Self {
            environment,
            cipher,
            hasher,
            tokenizer,
            batch,
        }
    }

    /// Build an engine from validated configuration, selecting the KMS backend.
    ///
    /// # Errors
    ///
    /// Returns an error if `HASH_KEY` cannot be decoded.
    pub async fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let kms: Arc<dyn KmsClient> = match cfg.kms_backend {
            KmsBackend::Aws => {
                let client = aws::build_kms_client(cfg.kms_endpoint.as_deref()).await;
                Arc::new(aws::AwsKms::new(client))
            }
            KmsBackend::Local => Arc::new(kms::LocalKms::new()),
        };
        info!(
            environment = %cfg.environment,
            backend = ?cfg.kms_backend,
            "PHI engine configured"
        );
        Ok(Self::new(
            kms,
            cfg.hash_key()?,
            cfg.environment.clone(),
            cfg.master_key_alias_prefix.clone(),
            Compressor::new(cfg.compression_threshold_bytes),
        ))
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Encryption context for `(clinic_id, field_type)` in this environment.
    pub fn context(&self, clinic_id: &str, field_type: &str) -> EncryptionContext {
        EncryptionContext::new(clinic_id, field_type, &self.environment)
    }

    /// Resolve, or provision on first use, this environment's master key.
    ///
    /// # Errors
    ///
    /// See [`KeyProvider::resolve_master_key`].
    pub async fn resolve_master_key(&self) -> Result<KeyHandle, EngineError> {
        self.cipher.keys().resolve_master_key(&self.environment).await
    }

    /// See [`FieldCipher::encrypt_field`].
    pub async fn encrypt_field(
        &self,
        plaintext: &str,
        context: &EncryptionContext,
    ) -> Result<EncryptedField, EngineError> {
        self.cipher.encrypt_field(plaintext, context).await
    }

    /// See [`FieldCipher::decrypt_field`].
    pub async fn decrypt_field(&self, field: &EncryptedField) -> Result<String, EngineError> {
        self.cipher.decrypt_field(field).await
    }

    /// See [`DeterministicHasher::hash`].
    pub fn hash(&self, plaintext: &str, clinic_id: &str, field_type: &str) -> Result<String, EngineError> {
        self.hasher.hash(plaintext, clinic_id, field_type)
    }

    /// See [`SearchTokenizer::generate_search_tokens`].
    pub async fn generate_search_tokens(
        &self,
        text: &str,
        clinic_id: &str,
    ) -> Result<EncryptedField, EngineError> {
        self.tokenizer.generate_search_tokens(text, clinic_id).await
    }

    /// Decrypt a stored token set and match `query` against it.
    ///
    /// # Errors
    ///
    /// Propagates decryption errors.
    pub async fn search_matches(&self, field: &EncryptedField, query: &str) -> Result<bool, EngineError> {
        self.tokenizer.search(field, query).await
    }

    /// See [`BatchCodec::encrypt_batch`].
    pub async fn encrypt_batch(
        &self,
        fields: HashMap<String, FieldInput>,
        clinic_id: &str,
    ) -> HashMap<String, FieldOutcome<EncryptedField>> {
        self.batch.encrypt_batch(fields, clinic_id).await
    }

    /// See [`BatchCodec::decrypt_batch`].
    pub async fn decrypt_batch(
        &self,
        fields: HashMap<String, EncryptedField>,
    ) -> HashMap<String, FieldOutcome<String>> {
        self.batch.decrypt_batch(fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> PhiEngine {
        PhiEngine::from_config(&config::tests::sample()).await.unwrap()
    }

    #[tokio::test]
    async fn from_config_local_backend_round_trips() {
        let engine = engine().await;
        assert_eq!(engine.environment(), "development");

        let ctx = engine.context("clinic-1", "ssn");
        let field = engine.encrypt_field("123-45-6789", &ctx).await.unwrap();
        assert!(field.context.contains(r#""environment":"development""#));
        assert_eq!(engine.decrypt_field(&field).await.unwrap(), "123-45-6789");

        let handle = engine.resolve_master_key().await.unwrap();
        assert_eq!(handle.key_id, field.key_id);
        assert_eq!(handle.alias, "alias/phi-field-encryption-development");
    }

    #[tokio::test]
    async fn context_for_another_environment_is_rejected() {
        let engine = engine().await;
        let foreign = EncryptionContext::new("clinic-1", "ssn", "production");
        assert!(matches!(
            engine.encrypt_field("123-45-6789", &foreign).await,
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn search_matches_through_facade() {
        let engine = engine().await;
        let tokens = engine
            .generate_search_tokens("Jane Smith (555) 123-4567", "clinic-1")
            .await
            .unwrap();
        assert!(engine.search_matches(&tokens, "smi").await.unwrap());
        assert!(engine.search_matches(&tokens, "5551234567").await.unwrap());
        assert!(!engine.search_matches(&tokens, "doe").await.unwrap());
    }

    #[tokio::test]
    async fn hash_is_stable_across_engines_with_same_key() {
        let a = engine().await;
        let b = engine().await;
        assert_eq!(
            a.hash("123-45-6789", "clinic-1", "ssn").unwrap(),
            b.hash("123-45-6789", "clinic-1", "ssn").unwrap()
        );
    }

    #[tokio::test]
    async fn batch_through_facade() {
        let engine = engine().await;
        let fields = HashMap::from([
            ("firstName".to_owned(), FieldInput::new("Jane", "name")),
            ("ssn".to_owned(), FieldInput::new("123-45-6789", "ssn")),
        ]);
        let stored: HashMap<String, EncryptedField> = engine
            .encrypt_batch(fields, "clinic-1")
            .await
            .into_iter()
            .map(|(name, outcome)| (name, outcome.unwrap()))
            .collect();
        let rendered = BatchCodec::render(engine.decrypt_batch(stored).await);
        assert_eq!(rendered["firstName"], "Jane");
        assert_eq!(rendered["ssn"], "123-45-6789");
    }
}

//! Single-field envelope encryption bound to an encryption context.

use std::sync::Arc;

use phi_common::{EncryptedField, EncryptionContext, EngineError};
use tracing::{debug, instrument};

use crate::crypto::{cipher, envelope, CipherError, Compressor, Envelope};
use crate::keys::KeyProvider;

impl From<CipherError> for EngineError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::AeadFailure => EngineError::AuthenticationFailure(
                "ciphertext failed authentication under the stored context".into(),
            ),
            CipherError::InvalidKeyLength => EngineError::Internal(e.to_string()),
        }
    }
}

/// Encrypts and decrypts individual PHI fields for one environment.
///
/// Every encryption uses a fresh KMS data key and a fresh nonce; the canonical
/// context is bound as AAD and as the KMS authorization context.
#[derive(Clone)]
pub struct FieldCipher {
    keys: Arc<KeyProvider>,
    compressor: Compressor,
    environment: String,
}

impl FieldCipher {
    pub fn new(keys: Arc<KeyProvider>, compressor: Compressor, environment: impl Into<String>) -> Self {
        Self {
            keys,
            compressor,
            environment: environment.into(),
        }
    }

    pub fn keys(&self) -> &Arc<KeyProvider> {
        &self.keys
    }

    /// The only environment this cipher encrypts for.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Encrypt `plaintext` under `context`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidInput`] for blank plaintext, an invalid
    ///   context, or a context for another environment, before any KMS call.
    /// - [`EngineError::KeyUnavailable`] / [`EngineError::Kms`] from the key layer.
    #[instrument(skip_all, fields(clinic_id = %context.clinic_id, field_type = %context.field_type))]
    pub async fn encrypt_field(
        &self,
        plaintext: &str,
        context: &EncryptionContext,
    ) -> Result<EncryptedField, EngineError> {
        if plaintext.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "plaintext must not be empty; omit the field instead".into(),
            ));
        }
        context.validate()?;
        if context.environment != self.environment {
            return Err(EngineError::InvalidInput(format!(
                "encryption context environment {:?} does not match configured environment {:?}",
                context.environment, self.environment
            )));
        }

        let master = self.keys.resolve_master_key(&context.environment).await?;
        let data_key = self.keys.generate_data_key(&master, context).await?;

        let (payload, compressed) = self.compressor.compress(plaintext.as_bytes())?;
        let aad = context.canonical();
        let sealed = cipher::seal(&payload, &data_key.key.0[..], aad.as_bytes())?;

        let envelope = Envelope {
            wrapped_key: data_key.wrapped.clone(),
            sealed,
            compressed,
        };
        debug!(compressed, key_id = %master.key_id, "field encrypted");
        Ok(EncryptedField::new(
            envelope.to_string(),
            master.key_id,
            aad,
        ))
    }

    /// Decrypt a stored field using the context recorded on it.
    ///
    /// # Errors
    ///
    /// - [`EngineError::UnsupportedVersion`] / [`EngineError::InvalidFormat`]
    ///   if the envelope cannot be read.
    /// - [`EngineError::AuthenticationFailure`] if the stored context was
    ///   altered, the KMS refuses to unwrap, or the tag check fails.
    #[instrument(skip_all, fields(key_id = %field.key_id))]
    pub async fn decrypt_field(&self, field: &EncryptedField) -> Result<String, EngineError> {
        envelope::check_version(&field.version)?;
        let envelope: Envelope = field.encrypted.parse()?;

        let kms_context = EncryptionContext::parse_kms_context(&field.context).map_err(|_| {
            EngineError::AuthenticationFailure("stored encryption context is unreadable".into())
        })?;

        let key = self
            .keys
            .unwrap_data_key(&field.key_id, &envelope.wrapped_key, &kms_context)
            .await?;
        let payload = cipher::open(&envelope.sealed, &key.0[..], field.context.as_bytes())?;
        drop(key);

        let bytes = self.compressor.decompress(payload, envelope.compressed)?;
        String::from_utf8(bytes)
            .map_err(|_| EngineError::InvalidFormat("decrypted payload is not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DEFAULT_ALIAS_PREFIX;
    use crate::kms::{LocalKms, MockKmsClient};

    fn local_cipher() -> FieldCipher {
        let keys = KeyProvider::new(Arc::new(LocalKms::new()), DEFAULT_ALIAS_PREFIX);
        FieldCipher::new(Arc::new(keys), Compressor::default(), "production")
    }

    fn ctx() -> EncryptionContext {
        EncryptionContext::new("clinic-1", "ssn", "production")
    }

    #[tokio::test]
    async fn round_trip() {
        let cipher = local_cipher();
        for s in ["123-45-6789", "x", "Zoë Ångström", "  padded  "] {
            let field = cipher.encrypt_field(s, &ctx()).await.unwrap();
            assert_eq!(cipher.decrypt_field(&field).await.unwrap(), s);
        }
    }

    #[tokio::test]
    async fn round_trip_below_and_above_compression_threshold() {
        let cipher = local_cipher();
        let short = "0123456789";
        let long: String = "Assessment: stable. Plan: follow up in two weeks. "
            .chars()
            .cycle()
            .take(5000)
            .collect();

        let f_short = cipher.encrypt_field(short, &ctx()).await.unwrap();
        let f_long = cipher.encrypt_field(&long, &ctx()).await.unwrap();
        assert!(f_short.encrypted.starts_with("v1.r."));
        assert!(f_long.encrypted.starts_with("v1.z."));
        assert_eq!(cipher.decrypt_field(&f_short).await.unwrap(), short);
        assert_eq!(cipher.decrypt_field(&f_long).await.unwrap(), long);
    }

    #[tokio::test]
    async fn field_records_key_context_and_version() {
        let cipher = local_cipher();
        let field = cipher.encrypt_field("555-0100", &ctx()).await.unwrap();
        let master = cipher.keys().resolve_master_key("production").await.unwrap();
        assert_eq!(field.key_id, master.key_id);
        assert_eq!(field.context, ctx().canonical());
        assert_eq!(field.version, "v1");
        assert!(!field.encrypted.contains("555-0100"));
    }

    #[tokio::test]
    async fn same_plaintext_encrypts_differently() {
        let cipher = local_cipher();
        let a = cipher.encrypt_field("same", &ctx()).await.unwrap();
        let b = cipher.encrypt_field("same", &ctx()).await.unwrap();
        assert_ne!(a.encrypted, b.encrypted);
    }

    #[tokio::test]
    async fn altered_context_fails_authentication() {
        let cipher = local_cipher();
        let field = cipher.encrypt_field("123-45-6789", &ctx()).await.unwrap();

        let mut swapped = field.clone();
        swapped.context = swapped.context.replace("clinic-1", "clinic-2");
        assert!(matches!(
            cipher.decrypt_field(&swapped).await,
            Err(EngineError::AuthenticationFailure(_))
        ));

        // Every single-byte change, including ones that break the JSON.
        let bytes = field.context.as_bytes();
        for i in 0..bytes.len() {
            let mut altered = bytes.to_vec();
            altered[i] = if altered[i] == b'x' { b'y' } else { b'x' };
            let mut tampered = field.clone();
            tampered.context = String::from_utf8(altered).unwrap();
            assert!(
                matches!(
                    cipher.decrypt_field(&tampered).await,
                    Err(EngineError::AuthenticationFailure(_))
                ),
                "byte {i} change was not rejected"
            );
        }
    }

    #[tokio::test]
    async fn cross_field_substitution_fails() {
        let cipher = local_cipher();
        let ssn = cipher.encrypt_field("123-45-6789", &ctx()).await.unwrap();
        let phone = cipher
            .encrypt_field("5551234567", &EncryptionContext::new("clinic-1", "phone", "production"))
            .await
            .unwrap();
        // Ciphertext from one field presented with the other field's context.
        let mut spliced = ssn.clone();
        spliced.context = phone.context.clone();
        assert!(matches!(
            cipher.decrypt_field(&spliced).await,
            Err(EngineError::AuthenticationFailure(_))
        ));
    }

    #[tokio::test]
    async fn tampered_ciphertext_fails_authentication() {
        let cipher = local_cipher();
        let field = cipher.encrypt_field("secret", &ctx()).await.unwrap();
        let mut env: Envelope = field.encrypted.parse().unwrap();
        env.sealed.ciphertext[0] ^= 0x01;
        let mut tampered = field.clone();
        tampered.encrypted = env.to_string();
        assert!(matches!(
            cipher.decrypt_field(&tampered).await,
            Err(EngineError::AuthenticationFailure(_))
        ));
    }

    #[tokio::test]
    async fn empty_and_blank_rejected_without_kms_call() {
        let mut kms = MockKmsClient::new();
        kms.expect_find_key_by_alias().times(0);
        kms.expect_create_key().times(0);
        kms.expect_generate_data_key().times(0);
        let keys = KeyProvider::new(Arc::new(kms), DEFAULT_ALIAS_PREFIX);
        let cipher = FieldCipher::new(Arc::new(keys), Compressor::default(), "production");

        for blank in ["", "   ", "\n\t"] {
            assert!(matches!(
                cipher.encrypt_field(blank, &ctx()).await,
                Err(EngineError::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn foreign_environment_rejected_without_kms_call() {
        let mut kms = MockKmsClient::new();
        kms.expect_find_key_by_alias().times(0);
        kms.expect_create_key().times(0);
        kms.expect_generate_data_key().times(0);
        let keys = KeyProvider::new(Arc::new(kms), DEFAULT_ALIAS_PREFIX);
        let cipher = FieldCipher::new(Arc::new(keys), Compressor::default(), "production");

        for env in ["staging", "production-2", "other-0"] {
            let foreign = EncryptionContext::new("clinic-1", "ssn", env);
            assert!(matches!(
                cipher.encrypt_field("123-45-6789", &foreign).await,
                Err(EngineError::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn foreign_environment_provisions_no_master_key() {
        let kms = Arc::new(LocalKms::new());
        let keys = KeyProvider::new(kms.clone(), DEFAULT_ALIAS_PREFIX);
        let cipher = FieldCipher::new(Arc::new(keys), Compressor::default(), "production");

        for i in 0..5 {
            let foreign = EncryptionContext::new("clinic-1", "ssn", format!("other-{i}"));
            assert!(cipher.encrypt_field("x", &foreign).await.is_err());
        }
        assert_eq!(kms.keys_created(), 0);

        cipher.encrypt_field("x", &ctx()).await.unwrap();
        assert_eq!(kms.keys_created(), 1);
    }

    #[tokio::test]
    async fn invalid_context_rejected() {
        let cipher = local_cipher();
        let bad = EncryptionContext::new("", "ssn", "production");
        assert!(matches!(
            cipher.encrypt_field("x", &bad).await,
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn unknown_version_rejected_before_parsing() {
        let cipher = local_cipher();
        let mut field = cipher.encrypt_field("x", &ctx()).await.unwrap();
        field.version = "v7".into();
        assert!(matches!(
            cipher.decrypt_field(&field).await,
            Err(EngineError::UnsupportedVersion(_))
        ));
    }

    #[tokio::test]
    async fn malformed_envelope_is_invalid_format() {
        let cipher = local_cipher();
        let mut field = cipher.encrypt_field("x", &ctx()).await.unwrap();
        field.encrypted = "v1.r.garbage".into();
        assert!(matches!(
            cipher.decrypt_field(&field).await,
            Err(EngineError::InvalidFormat(_))
        ));
    }
}

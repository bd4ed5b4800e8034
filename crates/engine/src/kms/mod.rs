//! Contract the engine requires of the external Key Management Service.
//!
//! # Contract
//!
//! - `generate_data_key` and `decrypt` always receive the encryption context.
//! - The KMS must refuse `decrypt` when the context differs from the one given
//!   to `generate_data_key`, reporting [`KmsError::InvalidCiphertext`].
//! - Master key lifecycle (create + alias) happens once per environment.
//!
//! Two implementations exist: [`crate::aws::AwsKms`] for AWS KMS and
//! [`LocalKms`] for development and tests.

pub mod local;

pub use local::LocalKms;

use async_trait::async_trait;
use phi_common::{EngineError, KmsContext};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors reported by a [`KmsClient`].
#[derive(Debug, Error)]
pub enum KmsError {
    /// The referenced key or alias does not exist.
    #[error("kms key not found: {0}")]
    NotFound(String),

    /// The wrapped key could not be unwrapped under the supplied key and context.
    #[error("kms refused to decrypt: {0}")]
    InvalidCiphertext(String),

    /// An alias with this name already exists.
    #[error("kms alias already exists: {0}")]
    AliasExists(String),

    /// Any other service or transport failure. Assumed transient.
    #[error("kms request failed: {0}")]
    Service(String),
}

impl From<KmsError> for EngineError {
    fn from(e: KmsError) -> Self {
        match e {
            KmsError::NotFound(_) => EngineError::KeyUnavailable(e.to_string()),
            KmsError::InvalidCiphertext(_) => EngineError::AuthenticationFailure(e.to_string()),
            KmsError::AliasExists(_) | KmsError::Service(_) => EngineError::Kms(e.to_string()),
        }
    }
}

/// Plaintext data key plus its KMS-wrapped form, as returned by the KMS.
///
/// Immediately moved into a [`crate::keys::DataKey`]; never stored.
pub struct GeneratedDataKey {
    pub plaintext: Vec<u8>,
    pub wrapped: Vec<u8>,
}

impl Drop for GeneratedDataKey {
    fn drop(&mut self) {
        self.plaintext.zeroize();
    }
}

impl ZeroizeOnDrop for GeneratedDataKey {}

/// Client for the external Key Management Service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KmsClient: Send + Sync {
    /// Resolve `alias` to a key ID, or `None` if the alias does not exist.
    async fn find_key_by_alias(&self, alias: &str) -> Result<Option<String>, KmsError>;

    /// Create a symmetric master key, point `alias` at it, and return its key ID.
    async fn create_key(&self, alias: &str, description: &str) -> Result<String, KmsError>;

    /// Generate a 256-bit data key under `key_id`, bound to `context`.
    async fn generate_data_key(
        &self,
        key_id: &str,
        context: &KmsContext,
    ) -> Result<GeneratedDataKey, KmsError>;

    /// Unwrap a data key previously produced by `generate_data_key`.
    async fn decrypt(
        &self,
        key_id: &str,
        wrapped: &[u8],
        context: &KmsContext,
    ) -> Result<Vec<u8>, KmsError>;
}

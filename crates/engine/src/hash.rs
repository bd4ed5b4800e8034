//! Salted one-way hashing for duplicate detection without decryption.
//!
//! # Construction
//!
//! ```text
//! salt   = HMAC-SHA256(hash_key, lp(purpose) || lp(clinic_id) || lp(field_type) || lp(environment))
//! digest = SHA-256(salt || plaintext)
//! ```
//!
//! `lp(x)` is `x` prefixed with its length as a big-endian `u32`, so distinct
//! tuples never encode to the same HMAC input. Dedup salts and search-token
//! salts differ only in `purpose` and are therefore independent PRF outputs.

use hmac::{Hmac, Mac};
use phi_common::EngineError;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted length of the hashing key.
pub const MIN_HASH_KEY_LEN: usize = 32;

/// What a derived salt is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaltPurpose {
    /// Duplicate-detection digests.
    Dedup,
    /// Salt appended to encrypted search token sets.
    SearchTokens,
}

impl SaltPurpose {
    fn label(self) -> &'static str {
        match self {
            SaltPurpose::Dedup => "phi-dedup-hash/v1",
            SaltPurpose::SearchTokens => "phi-search-salt/v1",
        }
    }
}

/// Secret keying the salt derivation. Zeroed on drop, redacted in `Debug`.
#[derive(Clone)]
pub struct HashKey(Vec<u8>);

impl HashKey {
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] if shorter than [`MIN_HASH_KEY_LEN`].
    pub fn new(bytes: Vec<u8>) -> Result<Self, EngineError> {
        if bytes.len() < MIN_HASH_KEY_LEN {
            return Err(EngineError::InvalidInput(format!(
                "hash key must be at least {MIN_HASH_KEY_LEN} bytes"
            )));
        }
        Ok(Self(bytes))
    }
}

impl Drop for HashKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl ZeroizeOnDrop for HashKey {}

impl std::fmt::Debug for HashKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HashKey([REDACTED])")
    }
}

/// Deterministic, salted, one-way hasher scoped to one environment.
#[derive(Clone, Debug)]
pub struct DeterministicHasher {
    key: HashKey,
    environment: String,
}

impl DeterministicHasher {
    pub fn new(key: HashKey, environment: impl Into<String>) -> Self {
        Self {
            key,
            environment: environment.into(),
        }
    }

    /// Hex digest of `plaintext` under the (clinic, field type, environment) salt.
    ///
    /// Identical inputs always produce identical digests; a different clinic or
    /// field type yields an unrelated digest.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] for blank plaintext or a blank
    /// clinic ID or field type.
    pub fn hash(&self, plaintext: &str, clinic_id: &str, field_type: &str) -> Result<String, EngineError> {
        if plaintext.trim().is_empty() {
            return Err(EngineError::InvalidInput("cannot hash empty plaintext".into()));
        }
        let salt = self.salt(SaltPurpose::Dedup, clinic_id, field_type)?;
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(plaintext.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Derive the salt for `purpose`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] if `clinic_id` or `field_type` is blank.
    pub fn salt(
        &self,
        purpose: SaltPurpose,
        clinic_id: &str,
        field_type: &str,
    ) -> Result<[u8; 32], EngineError> {
        if clinic_id.trim().is_empty() || field_type.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "salt derivation requires a clinic ID and field type".into(),
            ));
        }
        let mut mac = HmacSha256::new_from_slice(&self.key.0)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        for part in [purpose.label(), clinic_id, field_type, self.environment.as_str()] {
            mac.update(&(part.len() as u32).to_be_bytes());
            mac.update(part.as_bytes());
        }
        Ok(mac.finalize().into_bytes().into())
    }
}

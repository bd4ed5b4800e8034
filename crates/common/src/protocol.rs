//! Data model exchanged between the engine and its callers.
//!
//! [`EncryptedField`] is the only artifact that ever crosses a persistence
//! boundary. It is immutable once built; an update always produces a new one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Envelope format version written into every [`EncryptedField`].
pub const FORMAT_VERSION: &str = "v1";

/// Encryption context schema version bound into every context.
pub const CONTEXT_VERSION: &str = "1";

/// Field type label used for encrypted search token sets.
pub const SEARCH_TOKENS_FIELD_TYPE: &str = "search_tokens";

/// Flat string map handed to the KMS as its authorization context.
///
/// A `BTreeMap` so iteration order, and therefore the canonical JSON form, is
/// stable.
pub type KmsContext = BTreeMap<String, String>;

const KEY_CLINIC_ID: &str = "clinicId";
const KEY_FIELD_TYPE: &str = "fieldType";
const KEY_ENVIRONMENT: &str = "environment";
const KEY_VERSION: &str = "version";
const RESERVED_KEYS: [&str; 4] = [KEY_CLINIC_ID, KEY_FIELD_TYPE, KEY_ENVIRONMENT, KEY_VERSION];

// ---------------------------------------------------------------------------
// Encryption context
// ---------------------------------------------------------------------------

/// Tenant and purpose metadata bound into both the KMS authorization decision
/// and the AEAD additional authenticated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionContext {
    pub clinic_id: String,
    pub field_type: String,
    pub environment: String,
    pub version: String,
    /// Caller-supplied extra entries. Must not reuse a reserved key.
    pub extra: BTreeMap<String, String>,
}

impl EncryptionContext {
    /// Build a context for one clinic, field purpose and environment.
    pub fn new(
        clinic_id: impl Into<String>,
        field_type: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            clinic_id: clinic_id.into(),
            field_type: field_type.into(),
            environment: environment.into(),
            version: CONTEXT_VERSION.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Add an extra context entry.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Check that every mandatory entry is present and no extra shadows one.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] describing the first problem found.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, value) in [
            (KEY_CLINIC_ID, &self.clinic_id),
            (KEY_FIELD_TYPE, &self.field_type),
            (KEY_ENVIRONMENT, &self.environment),
            (KEY_VERSION, &self.version),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::InvalidInput(format!(
                    "encryption context {name} must not be empty"
                )));
            }
        }
        if let Some(key) = self.extra.keys().find(|k| RESERVED_KEYS.contains(&k.as_str())) {
            return Err(EngineError::InvalidInput(format!(
                "encryption context extra entry may not override reserved key {key}"
            )));
        }
        Ok(())
    }

    /// Flatten into the map sent to the KMS.
    pub fn to_kms_context(&self) -> KmsContext {
        let mut map = self.extra.clone();
        map.insert(KEY_CLINIC_ID.into(), self.clinic_id.clone());
        map.insert(KEY_FIELD_TYPE.into(), self.field_type.clone());
        map.insert(KEY_ENVIRONMENT.into(), self.environment.clone());
        map.insert(KEY_VERSION.into(), self.version.clone());
        map
    }

    /// Canonical serialized form: compact JSON with sorted keys.
    ///
    /// This exact string is stored on the field and used as AAD.
    pub fn canonical(&self) -> String {
        // A string-to-string map always serializes.
        serde_json::to_string(&self.to_kms_context()).unwrap_or_default()
    }

    /// Parse a stored canonical context back into its KMS map.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error if `s` is not a flat string map.
    pub fn parse_kms_context(s: &str) -> Result<KmsContext, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Rebuild a context from its KMS map.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] if a reserved entry is missing.
    pub fn from_kms_context(mut map: KmsContext) -> Result<Self, EngineError> {
        let mut take = |key: &str| {
            map.remove(key).ok_or_else(|| {
                EngineError::InvalidInput(format!("encryption context is missing {key}"))
            })
        };
        let clinic_id = take(KEY_CLINIC_ID)?;
        let field_type = take(KEY_FIELD_TYPE)?;
        let environment = take(KEY_ENVIRONMENT)?;
        let version = take(KEY_VERSION)?;
        Ok(Self {
            clinic_id,
            field_type,
            environment,
            version,
            extra: map,
        })
    }
}

// ---------------------------------------------------------------------------
// Persisted artifact
// ---------------------------------------------------------------------------

/// A single encrypted PHI field, as stored by the persistence layer.
///
/// The persistence layer must treat every attribute as opaque and replace the
/// whole structure on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedField {
    /// Self-contained ciphertext envelope.
    pub encrypted: String,
    /// Identifier of the master key that wrapped the data key.
    pub key_id: String,
    /// Canonical encryption context; the AAD and the KMS authorization context.
    pub context: String,
    /// Envelope format version.
    pub version: String,
    /// RFC 3339 creation time.
    pub timestamp: String,
}

impl EncryptedField {
    /// Assemble a field stamped with the current format version and time.
    pub fn new(encrypted: String, key_id: String, context: String) -> Self {
        Self {
            encrypted,
            key_id,
            context,
            version: FORMAT_VERSION.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch input
// ---------------------------------------------------------------------------

/// One entry of a batch encryption request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInput {
    /// Plaintext value. Blank values fail that entry only.
    pub value: String,
    /// Field purpose label, e.g. `"ssn"` or `"clinical_note"`.
    pub field_type: String,
    /// Extra encryption context entries for this field.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl FieldInput {
    /// Build an input with no extra context.
    pub fn new(value: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            field_type: field_type.into(),
            context: BTreeMap::new(),
        }
    }
}

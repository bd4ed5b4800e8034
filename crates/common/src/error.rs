//! Error taxonomy shared by every layer of the engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level engine error type.
///
/// Single-field operations return this directly to their caller. Batch
/// operations capture it per field as a [`FieldFailure`] instead.
///
/// Retry policy is carried by [`EngineError::is_retryable`]:
/// - [`EngineError::Kms`] → transient, retry with backoff
/// - everything else → permanent for the field in question
#[derive(Debug, Error)]
pub enum EngineError {
    /// Blank plaintext or a malformed encryption context. Rejected before any KMS call.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The environment's master key is missing and could not be provisioned.
    #[error("master key unavailable: {0}")]
    KeyUnavailable(String),

    /// AEAD tag mismatch, or the KMS refused to unwrap under the supplied context.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// A KMS or transport error that may succeed on retry.
    #[error("kms error: {0}")]
    Kms(String),

    /// The stored envelope could not be parsed.
    #[error("invalid encrypted field format: {0}")]
    InvalidFormat(String),

    /// The stored envelope was written by a format version this build does not read.
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(String),

    /// Gzip compression or decompression failed.
    #[error("compression failure: {0}")]
    Compression(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-readable code, safe to log.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::KeyUnavailable(_) => "key_unavailable",
            EngineError::AuthenticationFailure(_) => "authentication_failure",
            EngineError::Kms(_) => "kms_error",
            EngineError::InvalidFormat(_) => "invalid_format",
            EngineError::UnsupportedVersion(_) => "unsupported_version",
            EngineError::Compression(_) => "compression_failure",
            EngineError::Internal(_) => "internal_error",
        }
    }

    /// Returns `true` if the caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Kms(_))
    }
}

/// A per-field failure recorded inside a batch result.
///
/// Never carries plaintext; `message` is the rendered [`EngineError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFailure {
    /// Name of the field in the batch map.
    pub field: String,
    /// Machine-readable code from [`EngineError::code`].
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl FieldFailure {
    /// Visible marker rendered in place of a field that failed to decrypt.
    pub const SENTINEL: &'static str = "[DECRYPTION_FAILED]";

    /// Record `err` as the failure of `field`.
    pub fn new(field: impl Into<String>, err: &EngineError) -> Self {
        Self {
            field: field.into(),
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }

    /// A failure for a field whose task panicked before producing a result.
    pub fn panicked(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: "internal_error".into(),
            message: "field task panicked".into(),
        }
    }
}

//! Configuration loading and validation for the PHI engine.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any required variable is missing or invalid.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;

use crate::crypto::compress::DEFAULT_THRESHOLD;
use crate::hash::{HashKey, MIN_HASH_KEY_LEN};
use crate::keys::DEFAULT_ALIAS_PREFIX;

/// Which KMS implementation backs the key layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KmsBackend {
    /// AWS KMS through `aws-sdk-kms`.
    Aws,
    /// In-process KMS; keys live only as long as the process.
    Local,
}

/// Validated engine configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Deployment environment, bound into every encryption context. **Required.**
    pub environment: String,

    #[serde(default = "default_kms_backend")]
    pub kms_backend: KmsBackend,

    /// Endpoint URL override for the AWS KMS client.
    #[serde(default)]
    pub kms_endpoint: Option<String>,

    /// Master key alias is `alias/<prefix>-<environment>`.
    #[serde(default = "default_alias_prefix")]
    pub master_key_alias_prefix: String,

    /// Base64 secret keying the deterministic hasher. **Required.**
    pub hash_key: String,

    /// Payloads longer than this many bytes are gzip-compressed before sealing.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,

    /// OTLP collector endpoint. Spans are only exported when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_kms_backend() -> KmsBackend {
    KmsBackend::Aws
}
fn default_alias_prefix() -> String {
    DEFAULT_ALIAS_PREFIX.into()
}
fn default_compression_threshold() -> usize {
    DEFAULT_THRESHOLD
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Decode `HASH_KEY` into a [`HashKey`].
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not valid base64 or decodes to fewer
    /// than [`MIN_HASH_KEY_LEN`] bytes.
    pub fn hash_key(&self) -> Result<HashKey> {
        let bytes = STANDARD
            .decode(self.hash_key.trim())
            .context("HASH_KEY is not valid base64")?;
        HashKey::new(bytes)
            .map_err(|_| anyhow::anyhow!("HASH_KEY must decode to at least {MIN_HASH_KEY_LEN} bytes"))
    }

    /// OTLP endpoint, if one is configured and non-blank.
    pub fn otlp_endpoint(&self) -> Option<&str> {
        self.otel_exporter_otlp_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.environment, "ENVIRONMENT")?;
        ensure_non_empty(&self.master_key_alias_prefix, "MASTER_KEY_ALIAS_PREFIX")?;
        ensure_non_empty(&self.hash_key, "HASH_KEY")?;
        self.hash_key()?;

        if self.compression_threshold_bytes == 0 {
            anyhow::bail!("COMPRESSION_THRESHOLD_BYTES must be > 0");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("environment", &self.environment)
            .field("kms_backend", &self.kms_backend)
            .field("kms_endpoint", &self.kms_endpoint)
            .field("master_key_alias_prefix", &self.master_key_alias_prefix)
            .field("hash_key", &"[REDACTED]")
            .field("compression_threshold_bytes", &self.compression_threshold_bytes)
            .field("otel_exporter_otlp_endpoint", &self.otel_exporter_otlp_endpoint)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

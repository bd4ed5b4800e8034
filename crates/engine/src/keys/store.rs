//! Key material containers and the per-environment master key cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use phi_common::EngineError;
use tokio::sync::{OnceCell, RwLock};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::KEY_LEN;

/// Fixed-size key buffer that holds exactly [`KEY_LEN`] bytes.
///
/// When this type is dropped, the memory is overwritten with zeroes to
/// minimise the window during which plaintext key material lives in RAM.
pub struct KeyBytes(pub Box<[u8; KEY_LEN]>);

impl KeyBytes {
    /// Copy `bytes` into a new buffer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Kms`] if the slice is not [`KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EngineError> {
        if bytes.len() != KEY_LEN {
            return Err(EngineError::Kms(format!(
                "data key has invalid length: expected {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

impl Zeroize for KeyBytes {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl ZeroizeOnDrop for KeyBytes {}

impl std::fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("KeyBytes([REDACTED])")
    }
}

/// An ephemeral data key: plaintext bytes plus the KMS-wrapped form.
///
/// Lives for the duration of a single encrypt or decrypt call.
#[derive(Debug)]
pub struct DataKey {
    pub key: KeyBytes,
    pub wrapped: Vec<u8>,
}

/// A resolved master key for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    /// KMS key ID, recorded on every [`phi_common::EncryptedField`].
    pub key_id: String,
    /// Alias the key was resolved through.
    pub alias: String,
    pub environment: String,
}

/// Concurrency-safe cache of master key handles, one per environment.
///
/// Each environment gets a [`OnceCell`] slot so that concurrent first calls
/// await a single resolve-or-provision future instead of racing into
/// duplicate provisioning. A failed initialisation leaves the slot empty so
/// the next caller tries again.
#[derive(Clone, Debug, Default)]
pub struct MasterKeyCache {
    inner: Arc<RwLock<HashMap<String, Arc<OnceCell<KeyHandle>>>>>,
}

impl MasterKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached handle for `environment`, running `init` at most once
    /// across all concurrent callers until it succeeds.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `init`.
    pub async fn get_or_try_init<F, Fut>(
        &self,
        environment: &str,
        init: F,
    ) -> Result<KeyHandle, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<KeyHandle, EngineError>>,
    {
        let slot = self.slot(environment).await;
        slot.get_or_try_init(init).await.cloned()
    }

    /// Returns the cached handle without resolving.
    #[cfg(test)]
    pub(crate) async fn get(&self, environment: &str) -> Option<KeyHandle> {
        let map = self.inner.read().await;
        map.get(environment).and_then(|cell| cell.get().cloned())
    }

    /// Number of environments with a resolved handle.
    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        let map = self.inner.read().await;
        map.values().filter(|cell| cell.initialized()).count()
    }

    async fn slot(&self, environment: &str) -> Arc<OnceCell<KeyHandle>> {
        if let Some(cell) = self.inner.read().await.get(environment) {
            return Arc::clone(cell);
        }
        let mut map = self.inner.write().await;
        Arc::clone(map.entry(environment.to_owned()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(env: &str) -> KeyHandle {
        KeyHandle {
            key_id: format!("key-{env}"),
            alias: format!("alias/phi-{env}"),
            environment: env.into(),
        }
    }

    #[tokio::test]
    async fn initially_empty() {
        let cache = MasterKeyCache::new();
        assert_eq!(cache.len().await, 0);
        assert!(cache.get("production").await.is_none());
    }

    #[tokio::test]
    async fn init_runs_once() {
        let cache = MasterKeyCache::new();
        let first = cache
            .get_or_try_init("production", || async { Ok(handle("production")) })
            .await
            .unwrap();
        let second = cache
            .get_or_try_init("production", || async {
                Err(EngineError::Internal("must not run".into()))
            })
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn failed_init_is_not_cached() {
        let cache = MasterKeyCache::new();
        let err = cache
            .get_or_try_init("staging", || async {
                Err(EngineError::KeyUnavailable("no key".into()))
            })
            .await;
        assert!(err.is_err());
        assert!(cache.get("staging").await.is_none());
        let ok = cache
            .get_or_try_init("staging", || async { Ok(handle("staging")) })
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn environments_are_independent() {
        let cache = MasterKeyCache::new();
        for env in ["development", "production"] {
            cache
                .get_or_try_init(env, || async move { Ok(handle(env)) })
                .await
                .unwrap();
        }
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("development").await.unwrap().key_id, "key-development");
    }

    #[test]
    fn key_bytes_rejects_wrong_length() {
        assert!(KeyBytes::from_slice(&[0u8; 16]).is_err());
        assert!(KeyBytes::from_slice(&[0u8; KEY_LEN]).is_ok());
    }

    fn wiped_on_drop<T: ZeroizeOnDrop>() {}

    #[test]
    fn key_bytes_zeroize_clears_material() {
        wiped_on_drop::<KeyBytes>();
        let mut key = KeyBytes::from_slice(&[0xAB; KEY_LEN]).unwrap();
        key.zeroize();
        assert!(key.0.iter().all(|b| *b == 0));
    }

    #[test]
    fn key_bytes_redacted_in_debug() {
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf[0] = 0xFF;
        let key = KeyBytes(buf);
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}

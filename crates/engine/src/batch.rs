//! Concurrent fan-out of field encryption and decryption over a named map.
//!
//! Each field runs in its own Tokio task. A failure or panic in one field is
//! recorded as that field's [`FieldFailure`] and logged; sibling fields are
//! never cancelled and the batch as a whole never fails.

use std::collections::HashMap;

use futures::future::join_all;
use phi_common::{
    protocol::CONTEXT_VERSION, EncryptedField, EncryptionContext, EngineError, FieldFailure,
    FieldInput,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::field::FieldCipher;

/// Per-field batch result: the value, or why this field alone failed.
pub type FieldOutcome<T> = Result<T, FieldFailure>;

type FieldTask<T> = (String, JoinHandle<Result<T, EngineError>>);

/// Batch front-end over a [`FieldCipher`].
#[derive(Clone)]
pub struct BatchCodec {
    cipher: FieldCipher,
}

impl BatchCodec {
    pub fn new(cipher: FieldCipher) -> Self {
        Self { cipher }
    }

    /// Encrypt every entry of `fields` for `clinic_id`, concurrently.
    ///
    /// Each field's context is `{clinic_id, field_type, environment, version}`
    /// plus the entry's extra context.
    pub async fn encrypt_batch(
        &self,
        fields: HashMap<String, FieldInput>,
        clinic_id: &str,
    ) -> HashMap<String, FieldOutcome<EncryptedField>> {
        let tasks: Vec<FieldTask<EncryptedField>> = fields
            .into_iter()
            .map(|(name, input)| {
                let context = EncryptionContext {
                    clinic_id: clinic_id.to_owned(),
                    field_type: input.field_type,
                    environment: self.cipher.environment().to_owned(),
                    version: CONTEXT_VERSION.into(),
                    extra: input.context,
                };
                let value = input.value;
                let cipher = self.cipher.clone();
                let handle = tokio::spawn(async move { cipher.encrypt_field(&value, &context).await });
                (name, handle)
            })
            .collect();
        collect_outcomes(tasks, "encrypt").await
    }

    /// Decrypt every entry of `fields`, concurrently.
    pub async fn decrypt_batch(
        &self,
        fields: HashMap<String, EncryptedField>,
    ) -> HashMap<String, FieldOutcome<String>> {
        let tasks: Vec<FieldTask<String>> = fields
            .into_iter()
            .map(|(name, field)| {
                let cipher = self.cipher.clone();
                let handle = tokio::spawn(async move { cipher.decrypt_field(&field).await });
                (name, handle)
            })
            .collect();
        collect_outcomes(tasks, "decrypt").await
    }

    /// Flatten decrypt results for display, replacing failures with
    /// [`FieldFailure::SENTINEL`].
    pub fn render(results: HashMap<String, FieldOutcome<String>>) -> HashMap<String, String> {
        results
            .into_iter()
            .map(|(name, outcome)| {
                let shown = outcome.unwrap_or_else(|_| FieldFailure::SENTINEL.to_owned());
                (name, shown)
            })
            .collect()
    }
}

async fn collect_outcomes<T>(
    tasks: Vec<FieldTask<T>>,
    op: &'static str,
) -> HashMap<String, FieldOutcome<T>> {
    let total = tasks.len();
    let (names, handles): (Vec<String>, Vec<_>) = tasks.into_iter().unzip();
    let joined = join_all(handles).await;

    let mut failed = 0usize;
    let outcomes: HashMap<String, FieldOutcome<T>> = names
        .into_iter()
        .zip(joined)
        .map(|(name, result)| {
            let outcome = match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(field = %name, code = e.code(), op, "field failed; isolated from batch");
                    Err(FieldFailure::new(&name, &e))
                }
                Err(join_err) => {
                    failed += 1;
                    warn!(field = %name, op, panicked = join_err.is_panic(), "field task aborted");
                    Err(FieldFailure::panicked(&name))
                }
            };
            (name, outcome)
        })
        .collect();

    debug!(op, total, failed, "batch complete");
    outcomes
}

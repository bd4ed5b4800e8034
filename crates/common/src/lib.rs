//! Common types and errors shared across the PHI field encryption crates.

pub mod error;
pub mod protocol;

pub use error::{EngineError, FieldFailure};
pub use protocol::{EncryptedField, EncryptionContext, FieldInput, KmsContext};

//! Low-level cryptographic primitives: AEAD sealing, compression, envelope codec.
//!
//! This module is intentionally free of KMS dependencies. Keys arrive as raw
//! byte slices from the key layer and never leave the call stack.

pub mod cipher;
pub mod compress;
pub mod envelope;

pub use cipher::{CipherError, KEY_LEN};
pub use compress::Compressor;
pub use envelope::Envelope;

//! AES-256-GCM-SIV sealing and opening of a single payload under a data key.
//!
//! The serialized encryption context is passed as AAD, so a ciphertext opened
//! under any other context fails its tag check.
//!
//! A fresh random 96-bit nonce is drawn from the OS CSPRNG for every seal. Each
//! data key is used for exactly one seal, so nonce reuse under one key cannot
//! occur; GCM-SIV additionally stays safe if it ever did.

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes256GcmSiv, Nonce,
};
use thiserror::Error;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the AES-GCM-SIV authentication tag.
pub const TAG_LEN: usize = 16;

/// Output of [`seal`]: nonce, ciphertext and detached tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// Encryption failed, or decryption failed its authentication check.
    #[error("aead operation failed")]
    AeadFailure,
}

/// Encrypt `plaintext` under `key`, binding `aad`.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
pub fn seal(plaintext: &[u8], key: &[u8], aad: &[u8]) -> Result<Sealed, CipherError> {
    let cipher = build_cipher(key)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut out = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CipherError::AeadFailure)?;

    // The AEAD appends the tag; detach it for the envelope.
    let split = out.len().checked_sub(TAG_LEN).ok_or(CipherError::AeadFailure)?;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&out[split..]);
    out.truncate(split);

    Ok(Sealed {
        nonce,
        ciphertext: out,
        tag,
    })
}

/// Decrypt a [`Sealed`] payload under `key`, checking `aad`.
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] if authentication fails (wrong key,
/// wrong AAD or tampered data). No partial plaintext is ever returned.
pub fn open(sealed: &Sealed, key: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    let mut msg = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
    msg.extend_from_slice(&sealed.ciphertext);
    msg.extend_from_slice(&sealed.tag);
    cipher
        .decrypt(Nonce::from_slice(&sealed.nonce), Payload { msg: &msg, aad })
        .map_err(|_| CipherError::AeadFailure)
}

/// Fill a fresh random key buffer.
pub fn random_key() -> Box<[u8; KEY_LEN]> {
    let mut key = Box::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(key.as_mut_slice());
    key
}

fn build_cipher(key: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    Aes256GcmSiv::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)
}

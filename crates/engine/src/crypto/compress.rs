//! Threshold-gated gzip compression of plaintext before sealing.
//!
//! Short fields (names, phone numbers) pass through untouched; only payloads
//! longer than the threshold are compressed. The returned flag travels in the
//! envelope so decompression never guesses.

use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use phi_common::EngineError;

/// Default threshold in bytes above which plaintext is compressed.
pub const DEFAULT_THRESHOLD: usize = 1024;

/// Policy-driven gzip compressor.
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    threshold: usize,
}

impl Compressor {
    /// Compress payloads strictly longer than `threshold` bytes.
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    #[cfg(test)]
    pub(crate) fn threshold(&self) -> usize {
        self.threshold
    }

    /// Returns the payload to seal and whether it was compressed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Compression`] if the gzip stream cannot be written.
    pub fn compress(&self, plaintext: &[u8]) -> Result<(Vec<u8>, bool), EngineError> {
        if plaintext.len() <= self.threshold {
            return Ok((plaintext.to_vec(), false));
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(plaintext)
            .map_err(|e| EngineError::Compression(e.to_string()))?;
        let out = encoder
            .finish()
            .map_err(|e| EngineError::Compression(e.to_string()))?;
        Ok((out, true))
    }

    /// Exact inverse of [`Compressor::compress`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Compression`] if `compressed` is set and the
    /// payload is not a valid gzip stream.
    pub fn decompress(&self, payload: Vec<u8>, compressed: bool) -> Result<Vec<u8>, EngineError> {
        if !compressed {
            return Ok(payload);
        }
        let mut out = Vec::with_capacity(payload.len() * 4);
        GzDecoder::new(payload.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| EngineError::Compression(e.to_string()))?;
        Ok(out)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

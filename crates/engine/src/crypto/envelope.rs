//! The self-contained ciphertext envelope stored in `EncryptedField::encrypted`.
//!
//! ```text
//! v1.<z|r>.<b64url(wrapped_key)>.<b64url(nonce)>.<b64url(tag)>.<b64url(ciphertext)>
//! ```
//!
//! `z` marks a gzip-compressed payload, `r` a raw one.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use phi_common::{protocol::FORMAT_VERSION, EngineError};

use super::cipher::{Sealed, NONCE_LEN, TAG_LEN};

const COMPRESSED_FLAG: &str = "z";
const RAW_FLAG: &str = "r";
const PART_COUNT: usize = 6;

/// A parsed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// KMS-wrapped data key.
    pub wrapped_key: Vec<u8>,
    pub sealed: Sealed,
    pub compressed: bool,
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}.{}",
            FORMAT_VERSION,
            if self.compressed { COMPRESSED_FLAG } else { RAW_FLAG },
            URL_SAFE_NO_PAD.encode(&self.wrapped_key),
            URL_SAFE_NO_PAD.encode(self.sealed.nonce),
            URL_SAFE_NO_PAD.encode(self.sealed.tag),
            URL_SAFE_NO_PAD.encode(&self.sealed.ciphertext),
        )
    }
}

impl FromStr for Envelope {
    type Err = EngineError;

    /// Parse an envelope string.
    ///
    /// The version prefix is checked before anything else is decoded.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnsupportedVersion`] for a well-formed but unknown
    /// `vN` prefix and [`EngineError::InvalidFormat`] for anything else malformed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (version, rest) = s
            .split_once('.')
            .ok_or_else(|| EngineError::InvalidFormat("missing version prefix".into()))?;
        check_version(version)?;

        let parts: Vec<&str> = rest.split('.').collect();
        if parts.len() != PART_COUNT - 1 {
            return Err(EngineError::InvalidFormat(format!(
                "expected {PART_COUNT} envelope segments"
            )));
        }
        let compressed = match parts[0] {
            COMPRESSED_FLAG => true,
            RAW_FLAG => false,
            other => {
                return Err(EngineError::InvalidFormat(format!(
                    "unknown compression flag {other:?}"
                )))
            }
        };

        let wrapped_key = decode(parts[1], "wrapped key")?;
        if wrapped_key.is_empty() {
            return Err(EngineError::InvalidFormat("empty wrapped key".into()));
        }
        let nonce = decode_fixed::<NONCE_LEN>(parts[2], "nonce")?;
        let tag = decode_fixed::<TAG_LEN>(parts[3], "tag")?;
        let ciphertext = decode(parts[4], "ciphertext")?;

        Ok(Self {
            wrapped_key,
            sealed: Sealed {
                nonce,
                ciphertext,
                tag,
            },
            compressed,
        })
    }
}

/// Accept only the current format version.
///
/// # Errors
///
/// See [`Envelope`]'s [`FromStr`] impl.
pub fn check_version(version: &str) -> Result<(), EngineError> {
    if version == FORMAT_VERSION {
        return Ok(());
    }
    let looks_versioned = version
        .strip_prefix('v')
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
    if looks_versioned {
        Err(EngineError::UnsupportedVersion(version.to_owned()))
    } else {
        Err(EngineError::InvalidFormat(format!("bad version prefix {version:?}")))
    }
}

fn decode(part: &str, what: &str) -> Result<Vec<u8>, EngineError> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| EngineError::InvalidFormat(format!("{what} is not valid base64url")))
}

fn decode_fixed<const N: usize>(part: &str, what: &str) -> Result<[u8; N], EngineError> {
    let bytes = decode(part, what)?;
    bytes
        .try_into()
        .map_err(|_| EngineError::InvalidFormat(format!("{what} must be {N} bytes")))
}

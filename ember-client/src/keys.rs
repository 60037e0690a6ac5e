//! Key transformation.
//!
//! Application keys pass through one fixed transformer before validation
//! and hashing. Identity is the default; lowercase canonicalizes, sha1-hex
//! maps arbitrarily long keys under the 250-byte cap, and custom closures
//! cover everything else.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::error::ClientResult;
use ember_core::validate_key;

/// Maps application keys to protocol keys.
#[derive(Clone, Default)]
pub enum KeyTransformer {
    /// Pass the key through unchanged.
    #[default]
    Identity,
    /// ASCII-lowercase the key.
    Lowercase,
    /// Replace the key with the lowercase hex of its SHA-1 digest.
    Sha1Hex,
    /// An arbitrary caller-supplied mapping.
    Custom(Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>),
}

impl KeyTransformer {
    /// Transforms and validates an application key.
    ///
    /// # Errors
    /// Returns an error when the transformed key violates the protocol's
    /// key constraints.
    pub fn transform(&self, key: &[u8]) -> ClientResult<Bytes> {
        let out = match self {
            Self::Identity => Bytes::copy_from_slice(key),
            Self::Lowercase => Bytes::from(key.to_ascii_lowercase()),
            Self::Sha1Hex => Bytes::from(hex_digest(key)),
            Self::Custom(f) => Bytes::from(f(key)),
        };
        validate_key(&out)?;
        Ok(out)
    }
}

impl fmt::Debug for KeyTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Identity => "Identity",
            Self::Lowercase => "Lowercase",
            Self::Sha1Hex => "Sha1Hex",
            Self::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

fn hex_digest(key: &[u8]) -> Vec<u8> {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let digest = Sha1::digest(key);
    let mut out = Vec::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push(HEX[usize::from(byte >> 4)]);
        out.push(HEX[usize::from(byte & 0x0F)]);
    }
    out
}

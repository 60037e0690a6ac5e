//! The payload pair and protocol key validation.
//!
//! A stored value travels through the client as a [`Payload`]: the opaque
//! byte body plus the 32-bit flags word the server stores verbatim. The
//! transcoder owns what the flags mean; the wire layer only carries them.

use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::limits::MAX_KEY_BYTES;

/// A value as it crosses the wire: opaque bytes plus the type-tag flags.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload {
    /// Transcoder type tag, stored server-side verbatim.
    pub flags: u32,
    /// The serialized value body.
    pub data: Bytes,
}

impl Payload {
    /// Creates a payload from flags and a byte body.
    #[must_use]
    pub fn new(flags: u32, data: impl Into<Bytes>) -> Self {
        Self {
            flags,
            data: data.into(),
        }
    }

    /// Returns the length of the byte body.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true when the byte body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Bodies can be megabytes; show the length, not the bytes.
        f.debug_struct("Payload")
            .field("flags", &self.flags)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Validates a protocol key.
///
/// Keys must be 1–250 bytes with no control bytes (0x00–0x20) and no 0x7F.
/// Validation runs after the key transformer, so hashed or lower-cased keys
/// are checked in their final form.
///
/// # Errors
/// Returns an error naming the violated constraint.
pub fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey {
            reason: "key is empty",
            length: 0,
        });
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(Error::InvalidKey {
            reason: "key exceeds 250 bytes",
            length: key.len(),
        });
    }
    if key.iter().any(|&b| b <= 0x20 || b == 0x7F) {
        return Err(Error::InvalidKey {
            reason: "key contains control or space bytes",
            length: key.len(),
        });
    }
    Ok(())
}

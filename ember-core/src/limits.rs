//! Protocol limits and configuration bounds.
//!
//! Every buffer, key, and handshake in the client has an explicit maximum.
//! The protocol-fixed values (key length, header size) are constants; the
//! tunable ones live in [`Limits`] so tests and embedders can shrink them.

/// Maximum length of a protocol key in bytes (memcached limit).
pub const MAX_KEY_BYTES: usize = 250;

/// Maximum size of a stored value in bytes (memcached default, 1 MiB).
pub const MAX_VALUE_BYTES: usize = 1024 * 1024;

/// Size of a binary protocol packet header in bytes.
pub const HEADER_BYTES: usize = 24;

/// Maximum number of SASL continue steps before the handshake is abandoned.
pub const MAX_SASL_STEPS: u32 = 8;

/// Number of ring points each live node contributes to the ketama ring.
pub const RING_POINTS_PER_NODE: usize = 160;

/// Tunable client-wide limits.
///
/// Defaults are safe for most deployments; `for_testing` shrinks everything
/// so tests can hit the edges quickly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum total body (extras + key + value) of a single frame.
    pub max_frame_bytes: u32,
    /// Maximum number of keys in one multi-get call.
    pub max_batch_keys: u32,
    /// Maximum size of a connection's read buffer.
    pub max_read_buffer_bytes: u32,
}

impl Limits {
    /// Creates limits with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Extras + key + a full-size value, with headroom for the server
            // echoing the key back.
            max_frame_bytes: (MAX_VALUE_BYTES + MAX_KEY_BYTES + 64) as u32,
            max_batch_keys: 10_000,
            max_read_buffer_bytes: 4 * 1024 * 1024,
        }
    }

    /// Creates small limits for testing.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            max_frame_bytes: 64 * 1024,
            max_batch_keys: 256,
            max_read_buffer_bytes: 256 * 1024,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

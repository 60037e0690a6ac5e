//! Protocol-neutral request and response model.
//!
//! The client stack speaks in [`Request`] and [`Response`]; the dialect
//! codecs translate to and from bytes. Every storage command family is one
//! variant of one tagged enum, so adding a dialect means implementing a
//! codec, not a class hierarchy.

use bytes::{Buf, Bytes};
use ember_core::Payload;

use crate::opcode::Opcode;
use crate::status::Status;

/// Expiration sentinel for increment/decrement: fail on a missing key
/// instead of seeding the initial value.
pub const DELTA_NO_CREATE: u32 = 0xFFFF_FFFF;

/// How a store request treats an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
    /// Store unconditionally.
    Set,
}

impl StoreMode {
    /// The binary opcode for this mode.
    #[must_use]
    pub const fn opcode(self) -> Opcode {
        match self {
            Self::Add => Opcode::Add,
            Self::Replace => Opcode::Replace,
            Self::Set => Opcode::Set,
        }
    }

    /// The text dialect verb for this mode.
    #[must_use]
    pub const fn verb(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Replace => "replace",
            Self::Set => "set",
        }
    }
}

/// Which end of the value a concat request touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatDirection {
    /// Append after the existing bytes.
    Append,
    /// Prepend before the existing bytes.
    Prepend,
}

impl ConcatDirection {
    /// The binary opcode for this direction.
    #[must_use]
    pub const fn opcode(self) -> Opcode {
        match self {
            Self::Append => Opcode::Append,
            Self::Prepend => Opcode::Prepend,
        }
    }

    /// The text dialect verb for this direction.
    #[must_use]
    pub const fn verb(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Prepend => "prepend",
        }
    }
}

/// Which way a delta request moves a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaDirection {
    /// Add the delta.
    Increment,
    /// Subtract the delta, floored at zero.
    Decrement,
}

impl DeltaDirection {
    /// The binary opcode for this direction.
    #[must_use]
    pub const fn opcode(self) -> Opcode {
        match self {
            Self::Increment => Opcode::Increment,
            Self::Decrement => Opcode::Decrement,
        }
    }

    /// The text dialect verb for this direction.
    #[must_use]
    pub const fn verb(self) -> &'static str {
        match self {
            Self::Increment => "incr",
            Self::Decrement => "decr",
        }
    }
}

/// A protocol-neutral request.
///
/// Keys are already transformed and validated by the time a request is
/// built; the codecs put them on the wire byte-for-byte.
#[derive(Debug, Clone)]
pub enum Request {
    /// Fetch one value.
    Get {
        /// The protocol key.
        key: Bytes,
    },
    /// Fetch many values in one pipeline; misses produce no entry.
    GetBatch {
        /// The protocol keys.
        keys: Vec<Bytes>,
    },
    /// Store a payload under a key.
    Store {
        /// Existing-key policy.
        mode: StoreMode,
        /// The protocol key.
        key: Bytes,
        /// Flags and body.
        payload: Payload,
        /// Normalized expiration word.
        expiration: u32,
        /// Cas token; 0 for unconditional stores.
        cas: u64,
    },
    /// Append or prepend raw bytes to an existing value.
    Concat {
        /// Which end to touch.
        direction: ConcatDirection,
        /// The protocol key.
        key: Bytes,
        /// The bytes to splice in.
        data: Bytes,
        /// Cas token; 0 for unconditional concat.
        cas: u64,
    },
    /// Increment or decrement a numeric value.
    Delta {
        /// Which way to move.
        direction: DeltaDirection,
        /// The protocol key.
        key: Bytes,
        /// The amount to move by.
        delta: u64,
        /// Value seeded when the key is absent.
        initial: u64,
        /// Expiration word; [`DELTA_NO_CREATE`] fails on absent keys.
        expiration: u32,
    },
    /// Remove a key.
    Delete {
        /// The protocol key.
        key: Bytes,
        /// Cas token; 0 for unconditional delete.
        cas: u64,
    },
    /// Invalidate every item, now or after a delay.
    Flush {
        /// Seconds until the flush takes effect; 0 is immediate.
        delay: u32,
    },
    /// Request the statistics stream.
    Stats {
        /// Optional stats sub-group key.
        key: Option<Bytes>,
    },
    /// Request the server version string.
    Version,
    /// No-op; used as a pipeline delimiter and a ping.
    Noop,
    /// Ask the server to close this connection.
    Quit,
    /// List SASL mechanisms.
    SaslListMechs,
    /// Start a SASL handshake.
    SaslAuth {
        /// Mechanism name, e.g. "PLAIN".
        mechanism: String,
        /// Initial client response.
        data: Bytes,
    },
    /// Continue a SASL handshake.
    SaslStep {
        /// Mechanism name.
        mechanism: String,
        /// Continuation data.
        data: Bytes,
    },
}

/// One decoded server reply.
#[derive(Debug, Clone)]
pub struct Reply {
    /// The server's status word.
    pub status: Status,
    /// The item's cas token, 0 when the command yields none.
    pub cas: u64,
    /// The item's flags word, 0 when the command yields none.
    pub flags: u32,
    /// The key, when the command echoes it (quiet batch gets).
    pub key: Bytes,
    /// The value body, or the error text on failure statuses.
    pub body: Bytes,
}

impl Reply {
    /// Builds a bare status-only reply.
    #[must_use]
    pub const fn of_status(status: Status) -> Self {
        Self {
            status,
            cas: 0,
            flags: 0,
            key: Bytes::new(),
            body: Bytes::new(),
        }
    }

    /// The body as a transcoder payload.
    #[must_use]
    pub fn payload(&self) -> Payload {
        Payload::new(self.flags, self.body.clone())
    }

    /// Parses the body as a counter reply (8 big-endian bytes).
    #[must_use]
    pub fn counter(&self) -> Option<u64> {
        if self.body.len() == 8 {
            let mut body = self.body.clone();
            Some(body.get_u64())
        } else {
            None
        }
    }

    /// The body as human-readable text, for error messages.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        if self.body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.body).into_owned())
        }
    }
}

/// A decoded response: one reply, a batch of replies, or a stats table.
#[derive(Debug, Clone)]
pub enum Response {
    /// The reply to a single-packet command.
    One(Reply),
    /// The hits of a batch get; misses are simply absent.
    Batch(Vec<Reply>),
    /// The statistics stream, in server order.
    Stats(Vec<(String, String)>),
}

impl Response {
    /// Unwraps a single reply, treating a batch or stats response as a
    /// pairing bug.
    #[must_use]
    pub fn into_one(self) -> Option<Reply> {
        match self {
            Self::One(reply) => Some(reply),
            Self::Batch(_) | Self::Stats(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_mode_opcodes() {
        assert_eq!(StoreMode::Set.opcode().as_u8(), 0x01);
        assert_eq!(StoreMode::Add.opcode().as_u8(), 0x02);
        assert_eq!(StoreMode::Replace.opcode().as_u8(), 0x03);
    }

    #[test]
    fn test_counter_parse() {
        let reply = Reply {
            status: Status::NoError,
            cas: 1,
            flags: 0,
            key: Bytes::new(),
            body: Bytes::copy_from_slice(&7u64.to_be_bytes()),
        };
        assert_eq!(reply.counter(), Some(7));

        let short = Reply::of_status(Status::NoError);
        assert_eq!(short.counter(), None);
    }
}

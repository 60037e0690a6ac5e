//! Wire layer error types.

use thiserror::Error;

/// Errors raised while encoding or decoding protocol traffic.
///
/// Every variant is fatal for the connection that produced it: a socket
/// that surfaced a `ProtoError` carries undecodable or mispaired bytes and
/// must be destroyed, never reused.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The first byte of a packet was not the expected magic.
    #[error("bad magic byte {value:#04x} (expected {expected:#04x})")]
    BadMagic {
        /// The byte that was read.
        value: u8,
        /// The magic this side expected.
        expected: u8,
    },

    /// A frame announced a body larger than the configured limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// The announced total body size.
        size: u64,
        /// The configured maximum.
        max: u32,
    },

    /// A frame's internal lengths are inconsistent.
    #[error("malformed frame: {reason}")]
    MalformedFrame {
        /// What was inconsistent.
        reason: &'static str,
    },

    /// An opcode byte that this client does not implement.
    #[error("unknown opcode {value:#04x}")]
    UnknownOpcode {
        /// The opcode byte.
        value: u8,
    },

    /// A response arrived that pairs with no outstanding request.
    #[error("unexpected response: {reason}")]
    UnexpectedResponse {
        /// Why the response could not be paired.
        reason: &'static str,
    },

    /// A response opaque did not match the outstanding request.
    #[error("opaque mismatch: expected {expected}, got {actual}")]
    OpaqueMismatch {
        /// The opaque the codec assigned.
        expected: u32,
        /// The opaque the server echoed.
        actual: u32,
    },

    /// The selected dialect cannot express this request.
    #[error("unsupported on this protocol: {what}")]
    Unsupported {
        /// The request that cannot be expressed.
        what: &'static str,
    },

    /// A text dialect line did not parse.
    #[error("unparseable reply line: {line:?}")]
    TextParse {
        /// The offending line, lossily decoded.
        line: String,
    },
}

/// Result type for wire layer operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

//! The operation codec seam.
//!
//! A codec turns protocol-neutral requests into outbound bytes and inbound
//! bytes into responses. The server pool constructs one codec per socket
//! through [`Protocol::codec`]; everything above this seam is dialect-blind.

use bytes::BytesMut;
use ember_core::Limits;

use crate::binary::BinaryCodec;
use crate::error::ProtoResult;
use crate::message::{Request, Response};
use crate::text::TextCodec;

/// One socket's encoder/decoder pair.
///
/// Implementations are stateful: they remember outstanding requests and
/// pair responses against them. Instances must never be shared between
/// sockets.
pub trait OperationCodec: Send {
    /// Appends the wire form of `request` to `buf`.
    ///
    /// # Errors
    /// Returns an error when the request cannot be expressed in this
    /// dialect or exceeds frame limits.
    fn encode(&mut self, request: &Request, buf: &mut BytesMut) -> ProtoResult<()>;

    /// Decodes one response from `buf`, consuming exactly the bytes of
    /// complete frames.
    ///
    /// Returns `Ok(None)` until a full response is buffered; partial
    /// frames are never consumed.
    ///
    /// # Errors
    /// Returns an error on any protocol violation; the socket that fed the
    /// bytes must then be destroyed.
    fn decode(&mut self, buf: &mut BytesMut) -> ProtoResult<Option<Response>>;
}

/// Wire dialect selector: the operation factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// The memcached binary protocol.
    #[default]
    Binary,
    /// The CRLF text dialect.
    Text,
}

impl Protocol {
    /// Builds a fresh codec for one socket.
    #[must_use]
    pub fn codec(self, limits: Limits) -> Box<dyn OperationCodec> {
        match self {
            Self::Binary => Box::new(BinaryCodec::new(limits)),
            Self::Text => Box::new(TextCodec::new(limits)),
        }
    }

    /// Whether this dialect can run a SASL handshake.
    #[must_use]
    pub const fn supports_auth(self) -> bool {
        matches!(self, Self::Binary)
    }
}

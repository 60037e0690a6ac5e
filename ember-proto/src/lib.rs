//! Ember Proto - The memcached wire layer.
//!
//! This crate turns protocol-neutral [`Request`] values into bytes on the
//! wire and bytes back into [`Response`] values. Two dialects implement the
//! same [`OperationCodec`] seam:
//!
//! - **Binary** (default): the memcached binary protocol, 24-byte packet
//!   headers, quiet-get pipelining, SASL.
//! - **Text**: the CRLF line dialect, for servers or proxies that only
//!   speak ASCII commands.
//!
//! A codec instance is stateful and belongs to exactly one socket: it
//! assigns opaques, remembers what it asked, and pairs every incoming frame
//! against that expectation. Feeding it bytes from a socket it did not
//! write to is a protocol violation, not undefined behavior.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod binary;
mod codec;
mod error;
mod header;
mod message;
mod opcode;
mod status;
mod text;

pub use binary::BinaryCodec;
pub use codec::{OperationCodec, Protocol};
pub use error::{ProtoError, ProtoResult};
pub use header::{
    read_request_frame, read_response_frame, write_request, write_response, RequestFrame,
    RequestHeader, ResponseFrame, ResponseHeader, HEADER_BYTES, MAGIC_REQUEST, MAGIC_RESPONSE,
};
pub use message::{
    ConcatDirection, DeltaDirection, Reply, Request, Response, StoreMode, DELTA_NO_CREATE,
};
pub use opcode::Opcode;
pub use status::Status;
pub use text::TextCodec;

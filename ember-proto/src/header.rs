//! Binary protocol packet framing.
//!
//! # Wire Format
//!
//! Every packet, request or response, is a 24-byte header followed by
//! extras, key, and value in that order:
//!
//! ```text
//! 0       magic            1   (0x80 request / 0x81 response)
//! 1       opcode           1
//! 2..4    key length       2   big-endian
//! 4       extras length    1
//! 5       data type        1   (always 0)
//! 6..8    vbucket/status   2   (request: vbucket, 0 / response: status)
//! 8..12   total body       4   (extras + key + value)
//! 12..16  opaque           4   (echoed verbatim)
//! 16..24  cas              8
//! 24..    extras, key, value
//! ```
//!
//! The readers here never consume partial frames: until a complete packet
//! is buffered they return `Ok(None)` and leave the buffer untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ember_core::Limits;

use crate::error::{ProtoError, ProtoResult};
use crate::opcode::Opcode;
use crate::status::Status;

pub use ember_core::HEADER_BYTES;

/// Magic byte opening every request packet.
pub const MAGIC_REQUEST: u8 = 0x80;

/// Magic byte opening every response packet.
pub const MAGIC_RESPONSE: u8 = 0x81;

/// Parsed header of a request packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// The command.
    pub opcode: Opcode,
    /// Virtual bucket id; this client always writes 0.
    pub vbucket: u16,
    /// Caller-chosen pairing tag.
    pub opaque: u32,
    /// Compare-and-swap token, 0 when unused.
    pub cas: u64,
}

/// Parsed header of a response packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// The command this responds to.
    pub opcode: Opcode,
    /// The server's status word.
    pub status: Status,
    /// The request's opaque, echoed.
    pub opaque: u32,
    /// The item's cas token, when the command yields one.
    pub cas: u64,
}

/// A complete request packet, split into its sections.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    /// The parsed header.
    pub header: RequestHeader,
    /// The extras section.
    pub extras: Bytes,
    /// The key section.
    pub key: Bytes,
    /// The value section.
    pub value: Bytes,
}

/// A complete response packet, split into its sections.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    /// The parsed header.
    pub header: ResponseHeader,
    /// The extras section.
    pub extras: Bytes,
    /// The key section.
    pub key: Bytes,
    /// The value section.
    pub value: Bytes,
}

/// Appends a request packet to `buf`.
///
/// Writes exactly `24 + extras.len() + key.len() + value.len()` bytes.
#[allow(clippy::cast_possible_truncation)] // Section sizes are validated upstream.
pub fn write_request(
    buf: &mut BytesMut,
    opcode: Opcode,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) {
    let total_body = extras.len() + key.len() + value.len();
    buf.reserve(HEADER_BYTES + total_body);
    buf.put_u8(MAGIC_REQUEST);
    buf.put_u8(opcode.as_u8());
    buf.put_u16(key.len() as u16);
    buf.put_u8(extras.len() as u8);
    buf.put_u8(0); // data type
    buf.put_u16(0); // vbucket
    buf.put_u32(total_body as u32);
    buf.put_u32(opaque);
    buf.put_u64(cas);
    buf.put_slice(extras);
    buf.put_slice(key);
    buf.put_slice(value);
}

/// Appends a response packet to `buf`.
///
/// The client never sends responses; this exists for the other end of the
/// wire (test servers, proxies) so both directions share one layout.
#[allow(clippy::cast_possible_truncation)] // Section sizes are validated upstream.
pub fn write_response(
    buf: &mut BytesMut,
    opcode: Opcode,
    status: Status,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) {
    let total_body = extras.len() + key.len() + value.len();
    buf.reserve(HEADER_BYTES + total_body);
    buf.put_u8(MAGIC_RESPONSE);
    buf.put_u8(opcode.as_u8());
    buf.put_u16(key.len() as u16);
    buf.put_u8(extras.len() as u8);
    buf.put_u8(0); // data type
    buf.put_u16(status.code());
    buf.put_u32(total_body as u32);
    buf.put_u32(opaque);
    buf.put_u64(cas);
    buf.put_slice(extras);
    buf.put_slice(key);
    buf.put_slice(value);
}

/// Reads one complete response packet from `buf`, if buffered.
///
/// Returns `Ok(None)` until the full packet is available; partial frames
/// are never consumed.
///
/// # Errors
/// Returns an error on a bad magic byte, an unknown opcode, inconsistent
/// section lengths, or a body exceeding `limits.max_frame_bytes`.
pub fn read_response_frame(
    buf: &mut BytesMut,
    limits: &Limits,
) -> ProtoResult<Option<ResponseFrame>> {
    let Some(parts) = read_common(buf, MAGIC_RESPONSE, limits)? else {
        return Ok(None);
    };
    let (opcode, field, opaque, cas, extras, key, value) = parts;
    Ok(Some(ResponseFrame {
        header: ResponseHeader {
            opcode,
            status: Status::from_code(field),
            opaque,
            cas,
        },
        extras,
        key,
        value,
    }))
}

/// Reads one complete request packet from `buf`, if buffered.
///
/// The server-side twin of [`read_response_frame`], with the same
/// no-partial-consumption contract.
///
/// # Errors
/// Returns an error on a bad magic byte, an unknown opcode, inconsistent
/// section lengths, or a body exceeding `limits.max_frame_bytes`.
pub fn read_request_frame(
    buf: &mut BytesMut,
    limits: &Limits,
) -> ProtoResult<Option<RequestFrame>> {
    let Some(parts) = read_common(buf, MAGIC_REQUEST, limits)? else {
        return Ok(None);
    };
    let (opcode, field, opaque, cas, extras, key, value) = parts;
    Ok(Some(RequestFrame {
        header: RequestHeader {
            opcode,
            vbucket: field,
            opaque,
            cas,
        },
        extras,
        key,
        value,
    }))
}

type FrameParts = (Opcode, u16, u32, u64, Bytes, Bytes, Bytes);

fn read_common(
    buf: &mut BytesMut,
    expected_magic: u8,
    limits: &Limits,
) -> ProtoResult<Option<FrameParts>> {
    if buf.len() < HEADER_BYTES {
        return Ok(None);
    }

    let magic = buf[0];
    if magic != expected_magic {
        return Err(ProtoError::BadMagic {
            value: magic,
            expected: expected_magic,
        });
    }

    let opcode_byte = buf[1];
    let key_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    let extras_len = usize::from(buf[4]);
    let field = u16::from_be_bytes([buf[6], buf[7]]);
    let total_body = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    let opaque = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
    let cas = u64::from_be_bytes([
        buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
    ]);

    if total_body as u64 > u64::from(limits.max_frame_bytes) {
        return Err(ProtoError::FrameTooLarge {
            size: total_body as u64,
            max: limits.max_frame_bytes,
        });
    }
    if extras_len + key_len > total_body {
        return Err(ProtoError::MalformedFrame {
            reason: "extras and key exceed total body",
        });
    }

    // The whole packet must be buffered before anything is consumed.
    if buf.len() < HEADER_BYTES + total_body {
        return Ok(None);
    }

    let opcode =
        Opcode::from_u8(opcode_byte).ok_or(ProtoError::UnknownOpcode { value: opcode_byte })?;

    let mut frame = buf.split_to(HEADER_BYTES + total_body).freeze();
    frame.advance(HEADER_BYTES);
    let extras = frame.split_to(extras_len);
    let key = frame.split_to(key_len);
    let value = frame;

    Ok(Some((opcode, field, opaque, cas, extras, key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout_golden() {
        let mut buf = BytesMut::new();
        let extras = [0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x3C];
        write_request(
            &mut buf,
            Opcode::Set,
            0x1234_5678,
            0x0102_0304_0506_0708,
            &extras,
            b"abc",
            b"hi",
        );

        assert_eq!(buf.len(), HEADER_BYTES + 8 + 3 + 2);
        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[1], 0x01);
        assert_eq!(&buf[2..4], &[0x00, 0x03]); // key length
        assert_eq!(buf[4], 0x08); // extras length
        assert_eq!(buf[5], 0x00); // data type
        assert_eq!(&buf[6..8], &[0x00, 0x00]); // vbucket
        assert_eq!(&buf[8..12], &[0x00, 0x00, 0x00, 0x0D]); // total body = 13
        assert_eq!(&buf[12..16], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&buf[16..24], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&buf[24..32], &extras);
        assert_eq!(&buf[32..35], b"abc");
        assert_eq!(&buf[35..37], b"hi");
    }

    #[test]
    fn test_response_roundtrip() {
        let mut buf = BytesMut::new();
        write_response(
            &mut buf,
            Opcode::Get,
            Status::NoError,
            42,
            99,
            &[0, 0, 0, 1],
            b"",
            b"value",
        );

        let frame = read_response_frame(&mut buf, &Limits::new())
            .unwrap()
            .unwrap();
        assert_eq!(frame.header.opcode, Opcode::Get);
        assert_eq!(frame.header.status, Status::NoError);
        assert_eq!(frame.header.opaque, 42);
        assert_eq!(frame.header.cas, 99);
        assert_eq!(frame.extras.as_ref(), &[0, 0, 0, 1]);
        assert_eq!(frame.value.as_ref(), b"value");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_not_consumed() {
        let mut full = BytesMut::new();
        write_response(
            &mut full,
            Opcode::Get,
            Status::NoError,
            1,
            0,
            &[0, 0, 0, 0],
            b"",
            b"abcdef",
        );

        let mut buf = BytesMut::new();
        for cut in [1, HEADER_BYTES - 1, HEADER_BYTES, full.len() - 1] {
            buf.clear();
            buf.extend_from_slice(&full[..cut]);
            let before = buf.len();
            assert!(read_response_frame(&mut buf, &Limits::new())
                .unwrap()
                .is_none());
            assert_eq!(buf.len(), before, "partial frame must not be consumed");
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = BytesMut::new();
        write_request(&mut buf, Opcode::Get, 1, 0, &[], b"k", b"");
        // A request magic where a response is expected poisons the stream.
        let err = read_response_frame(&mut buf, &Limits::new()).unwrap_err();
        assert!(matches!(err, ProtoError::BadMagic { value: 0x80, .. }));
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(MAGIC_RESPONSE);
        buf.put_u8(0x00);
        buf.put_u16(0);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u32(u32::MAX); // absurd total body
        buf.put_u32(0);
        buf.put_u64(0);
        let err = read_response_frame(&mut buf, &Limits::for_testing()).unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_inconsistent_lengths_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(MAGIC_RESPONSE);
        buf.put_u8(0x00);
        buf.put_u16(10); // key length 10
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u32(4); // but total body only 4
        buf.put_u32(0);
        buf.put_u64(0);
        buf.put_slice(&[0, 0, 0, 0]);
        let err = read_response_frame(&mut buf, &Limits::new()).unwrap_err();
        assert!(matches!(err, ProtoError::MalformedFrame { .. }));
    }
}

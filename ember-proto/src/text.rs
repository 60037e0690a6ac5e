//! The text dialect codec.
//!
//! CRLF-framed ASCII commands, the parallel variant of the binary dialect
//! behind the same [`OperationCodec`] seam. Replies map onto the binary
//! status vocabulary (`STORED` → `NoError`, `NOT_STORED` → `ItemNotStored`,
//! `EXISTS` → `KeyExists`, `NOT_FOUND` → `KeyNotFound`, `CLIENT_ERROR` →
//! `InvalidArguments`, `SERVER_ERROR` → `OutOfMemory`).
//!
//! Dialect gaps, surfaced as encode errors or narrower semantics:
//!
//! - SASL does not exist here; authentication is binary-only.
//! - `incr`/`decr` cannot seed an initial value, so a delta on a missing
//!   key reports `KeyNotFound` regardless of the request's initial.
//! - Store replies carry no cas token; `gets` is used for reads so cas
//!   tokens remain observable.
//!
//! The decoder scans the buffered bytes without consuming them and only
//! advances the buffer once a complete reply has parsed, preserving the
//! no-partial-consumption contract of the binary framing.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ember_core::Limits;

use crate::codec::OperationCodec;
use crate::error::{ProtoError, ProtoResult};
use crate::message::{Reply, Request, Response};
use crate::status::Status;

/// What the codec is waiting for, oldest first.
#[derive(Debug, Clone, Copy)]
enum Pending {
    /// `VALUE ... END` block; `single` collapses it to one reply.
    Values { single: bool },
    /// A one-line store verdict.
    Stored,
    /// A one-line counter value or miss.
    Delta,
    /// A one-line delete verdict.
    Deleted,
    /// A one-line `OK`.
    Flushed,
    /// `STAT ... END` block.
    Stats,
    /// A one-line `VERSION`.
    Version,
}

/// Stateful text protocol codec for one socket.
#[derive(Debug)]
pub struct TextCodec {
    limits: Limits,
    pending: VecDeque<Pending>,
}

impl TextCodec {
    /// Creates a codec with the given frame limits.
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            pending: VecDeque::new(),
        }
    }

    fn check_body(&self, len: usize) -> ProtoResult<()> {
        if len as u64 > u64::from(self.limits.max_frame_bytes) {
            return Err(ProtoError::FrameTooLarge {
                size: len as u64,
                max: self.limits.max_frame_bytes,
            });
        }
        Ok(())
    }
}

impl OperationCodec for TextCodec {
    fn encode(&mut self, request: &Request, buf: &mut BytesMut) -> ProtoResult<()> {
        match request {
            Request::Get { key } => {
                buf.put_slice(b"gets ");
                buf.put_slice(key);
                buf.put_slice(b"\r\n");
                self.pending.push_back(Pending::Values { single: true });
            }
            Request::GetBatch { keys } => {
                if keys.is_empty() {
                    return Err(ProtoError::Unsupported {
                        what: "empty batch get",
                    });
                }
                buf.put_slice(b"gets");
                for key in keys {
                    buf.put_u8(b' ');
                    buf.put_slice(key);
                }
                buf.put_slice(b"\r\n");
                self.pending.push_back(Pending::Values { single: false });
            }
            Request::Store {
                mode,
                key,
                payload,
                expiration,
                cas,
            } => {
                self.check_body(payload.data.len())?;
                if *cas == 0 {
                    buf.put_slice(mode.verb().as_bytes());
                } else {
                    buf.put_slice(b"cas");
                }
                buf.put_u8(b' ');
                buf.put_slice(key);
                let line = if *cas == 0 {
                    format!(" {} {} {}\r\n", payload.flags, expiration, payload.data.len())
                } else {
                    format!(
                        " {} {} {} {}\r\n",
                        payload.flags,
                        expiration,
                        payload.data.len(),
                        cas
                    )
                };
                buf.put_slice(line.as_bytes());
                buf.put_slice(&payload.data);
                buf.put_slice(b"\r\n");
                self.pending.push_back(Pending::Stored);
            }
            Request::Concat {
                direction,
                key,
                data,
                cas,
            } => {
                if *cas != 0 {
                    return Err(ProtoError::Unsupported {
                        what: "concat with cas on the text protocol",
                    });
                }
                self.check_body(data.len())?;
                buf.put_slice(direction.verb().as_bytes());
                buf.put_u8(b' ');
                buf.put_slice(key);
                buf.put_slice(format!(" 0 0 {}\r\n", data.len()).as_bytes());
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
                self.pending.push_back(Pending::Stored);
            }
            Request::Delta {
                direction,
                key,
                delta,
                ..
            } => {
                buf.put_slice(direction.verb().as_bytes());
                buf.put_u8(b' ');
                buf.put_slice(key);
                buf.put_slice(format!(" {delta}\r\n").as_bytes());
                self.pending.push_back(Pending::Delta);
            }
            Request::Delete { key, cas } => {
                if *cas != 0 {
                    return Err(ProtoError::Unsupported {
                        what: "delete with cas on the text protocol",
                    });
                }
                buf.put_slice(b"delete ");
                buf.put_slice(key);
                buf.put_slice(b"\r\n");
                self.pending.push_back(Pending::Deleted);
            }
            Request::Flush { delay } => {
                if *delay == 0 {
                    buf.put_slice(b"flush_all\r\n");
                } else {
                    buf.put_slice(format!("flush_all {delay}\r\n").as_bytes());
                }
                self.pending.push_back(Pending::Flushed);
            }
            Request::Stats { key } => {
                match key {
                    Some(key) => {
                        buf.put_slice(b"stats ");
                        buf.put_slice(key);
                        buf.put_slice(b"\r\n");
                    }
                    None => buf.put_slice(b"stats\r\n"),
                }
                self.pending.push_back(Pending::Stats);
            }
            Request::Version => {
                buf.put_slice(b"version\r\n");
                self.pending.push_back(Pending::Version);
            }
            Request::Quit => {
                // quit gets no reply; the server just closes.
                buf.put_slice(b"quit\r\n");
            }
            Request::Noop => {
                return Err(ProtoError::Unsupported {
                    what: "noop on the text protocol",
                })
            }
            Request::SaslListMechs | Request::SaslAuth { .. } | Request::SaslStep { .. } => {
                return Err(ProtoError::Unsupported {
                    what: "sasl on the text protocol",
                })
            }
        }
        Ok(())
    }

    fn decode(&mut self, buf: &mut BytesMut) -> ProtoResult<Option<Response>> {
        let Some(pending) = self.pending.front().copied() else {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProtoError::UnexpectedResponse {
                reason: "reply bytes with no outstanding request",
            });
        };

        let mut pos = 0usize;
        let parsed = match pending {
            Pending::Values { single } => parse_values(&self.limits, buf, &mut pos, single)?,
            Pending::Stored => parse_one_line(buf, &mut pos, parse_store_line)?,
            Pending::Delta => parse_one_line(buf, &mut pos, parse_delta_line)?,
            Pending::Deleted => parse_one_line(buf, &mut pos, parse_delete_line)?,
            Pending::Flushed => parse_one_line(buf, &mut pos, parse_flush_line)?,
            Pending::Stats => parse_stats(buf, &mut pos)?,
            Pending::Version => parse_one_line(buf, &mut pos, parse_version_line)?,
        };

        match parsed {
            Some(response) => {
                self.pending.pop_front();
                buf.advance(pos);
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }
}

/// Takes the next CRLF-terminated line starting at `*pos`, advancing `*pos`
/// past the terminator. Returns `None` when no full line is buffered.
fn take_line<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let rest = &buf[*pos..];
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    *pos += end + 2;
    Some(&rest[..end])
}

fn parse_err(line: &[u8]) -> ProtoError {
    ProtoError::TextParse {
        line: String::from_utf8_lossy(line).into_owned(),
    }
}

/// Maps the shared error lines every command can answer with.
fn common_error_line(line: &[u8]) -> Option<Reply> {
    if line == b"ERROR" {
        return Some(Reply::of_status(Status::UnknownCommand));
    }
    if let Some(msg) = line.strip_prefix(b"CLIENT_ERROR ") {
        let status = if msg
            .windows(b"non-numeric".len())
            .any(|w| w == b"non-numeric")
        {
            Status::NonNumericValue
        } else {
            Status::InvalidArguments
        };
        let mut reply = Reply::of_status(status);
        reply.body = Bytes::copy_from_slice(msg);
        return Some(reply);
    }
    if let Some(msg) = line.strip_prefix(b"SERVER_ERROR ") {
        let mut reply = Reply::of_status(Status::OutOfMemory);
        reply.body = Bytes::copy_from_slice(msg);
        return Some(reply);
    }
    None
}

fn parse_one_line(
    buf: &[u8],
    pos: &mut usize,
    parse: fn(&[u8]) -> ProtoResult<Reply>,
) -> ProtoResult<Option<Response>> {
    let Some(line) = take_line(buf, pos) else {
        return Ok(None);
    };
    if let Some(reply) = common_error_line(line) {
        return Ok(Some(Response::One(reply)));
    }
    Ok(Some(Response::One(parse(line)?)))
}

fn parse_store_line(line: &[u8]) -> ProtoResult<Reply> {
    let status = match line {
        b"STORED" => Status::NoError,
        b"NOT_STORED" => Status::ItemNotStored,
        b"EXISTS" => Status::KeyExists,
        b"NOT_FOUND" => Status::KeyNotFound,
        _ => return Err(parse_err(line)),
    };
    Ok(Reply::of_status(status))
}

fn parse_delta_line(line: &[u8]) -> ProtoResult<Reply> {
    if line == b"NOT_FOUND" {
        return Ok(Reply::of_status(Status::KeyNotFound));
    }
    let text = std::str::from_utf8(line).map_err(|_| parse_err(line))?;
    let value: u64 = text.trim().parse().map_err(|_| parse_err(line))?;
    let mut reply = Reply::of_status(Status::NoError);
    reply.body = Bytes::copy_from_slice(&value.to_be_bytes());
    Ok(reply)
}

fn parse_delete_line(line: &[u8]) -> ProtoResult<Reply> {
    let status = match line {
        b"DELETED" => Status::NoError,
        b"NOT_FOUND" => Status::KeyNotFound,
        _ => return Err(parse_err(line)),
    };
    Ok(Reply::of_status(status))
}

fn parse_flush_line(line: &[u8]) -> ProtoResult<Reply> {
    if line == b"OK" {
        Ok(Reply::of_status(Status::NoError))
    } else {
        Err(parse_err(line))
    }
}

fn parse_version_line(line: &[u8]) -> ProtoResult<Reply> {
    let Some(version) = line.strip_prefix(b"VERSION ") else {
        return Err(parse_err(line));
    };
    let mut reply = Reply::of_status(Status::NoError);
    reply.body = Bytes::copy_from_slice(version);
    Ok(reply)
}

fn parse_values(
    limits: &Limits,
    buf: &[u8],
    pos: &mut usize,
    single: bool,
) -> ProtoResult<Option<Response>> {
    let mut entries = Vec::new();
    loop {
        let Some(line) = take_line(buf, pos) else {
            return Ok(None);
        };

        if line == b"END" {
            let response = if single {
                let reply = entries
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| Reply::of_status(Status::KeyNotFound));
                Response::One(reply)
            } else {
                Response::Batch(entries)
            };
            return Ok(Some(response));
        }

        if let Some(header) = line.strip_prefix(b"VALUE ") {
            let text = std::str::from_utf8(header).map_err(|_| parse_err(line))?;
            let mut fields = text.split_ascii_whitespace();
            let key = fields.next().ok_or_else(|| parse_err(line))?;
            let flags: u32 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| parse_err(line))?;
            let length: usize = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| parse_err(line))?;
            let cas: u64 = match fields.next() {
                Some(field) => field.parse().map_err(|_| parse_err(line))?,
                None => 0,
            };

            if length as u64 > u64::from(limits.max_frame_bytes) {
                return Err(ProtoError::FrameTooLarge {
                    size: length as u64,
                    max: limits.max_frame_bytes,
                });
            }
            if buf.len() < *pos + length + 2 {
                return Ok(None);
            }
            let data = &buf[*pos..*pos + length];
            if &buf[*pos + length..*pos + length + 2] != b"\r\n" {
                return Err(ProtoError::MalformedFrame {
                    reason: "value block not CRLF-terminated",
                });
            }
            *pos += length + 2;

            entries.push(Reply {
                status: Status::NoError,
                cas,
                flags,
                key: Bytes::copy_from_slice(key.as_bytes()),
                body: Bytes::copy_from_slice(data),
            });
            continue;
        }

        if let Some(reply) = common_error_line(line) {
            if single {
                // Shaped like any other failed reply; the caller sees the
                // mapped status instead of a dead socket.
                return Ok(Some(Response::One(reply)));
            }
            return Err(ProtoError::UnexpectedResponse {
                reason: "error reply inside a batch get",
            });
        }

        return Err(parse_err(line));
    }
}

fn parse_stats(buf: &[u8], pos: &mut usize) -> ProtoResult<Option<Response>> {
    let mut table = Vec::new();
    loop {
        let Some(line) = take_line(buf, pos) else {
            return Ok(None);
        };
        if line == b"END" {
            return Ok(Some(Response::Stats(table)));
        }
        let Some(stat) = line.strip_prefix(b"STAT ") else {
            return Err(parse_err(line));
        };
        let text = std::str::from_utf8(stat).map_err(|_| parse_err(line))?;
        let (name, value) = text.split_once(' ').unwrap_or((text, ""));
        table.push((name.to_string(), value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use ember_core::Payload;

    use super::*;
    use crate::message::StoreMode;

    fn feed(codec: &mut TextCodec, text: &str) -> ProtoResult<Option<Response>> {
        let mut buf = BytesMut::from(text.as_bytes());
        codec.decode(&mut buf)
    }

    #[test]
    fn test_set_encode_and_stored() {
        let mut codec = TextCodec::new(Limits::new());
        let mut out = BytesMut::new();
        codec
            .encode(
                &Request::Store {
                    mode: StoreMode::Set,
                    key: Bytes::from_static(b"k"),
                    payload: Payload::new(7, &b"hello"[..]),
                    expiration: 60,
                    cas: 0,
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(out.as_ref(), b"set k 7 60 5\r\nhello\r\n");

        let response = feed(&mut codec, "STORED\r\n").unwrap().unwrap();
        assert!(response.into_one().unwrap().status.is_success());
    }

    #[test]
    fn test_cas_encode() {
        let mut codec = TextCodec::new(Limits::new());
        let mut out = BytesMut::new();
        codec
            .encode(
                &Request::Store {
                    mode: StoreMode::Set,
                    key: Bytes::from_static(b"k"),
                    payload: Payload::new(0, &b"v"[..]),
                    expiration: 0,
                    cas: 99,
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(out.as_ref(), b"cas k 0 0 1 99\r\nv\r\n");
    }

    #[test]
    fn test_single_get_hit_and_miss() {
        let mut codec = TextCodec::new(Limits::new());
        let mut out = BytesMut::new();
        codec
            .encode(
                &Request::Get {
                    key: Bytes::from_static(b"k"),
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(out.as_ref(), b"gets k\r\n");

        let response = feed(&mut codec, "VALUE k 7 5 31\r\nhello\r\nEND\r\n")
            .unwrap()
            .unwrap();
        let reply = response.into_one().unwrap();
        assert_eq!(reply.flags, 7);
        assert_eq!(reply.cas, 31);
        assert_eq!(reply.body.as_ref(), b"hello");

        codec
            .encode(
                &Request::Get {
                    key: Bytes::from_static(b"missing"),
                },
                &mut BytesMut::new(),
            )
            .unwrap();
        let response = feed(&mut codec, "END\r\n").unwrap().unwrap();
        assert_eq!(response.into_one().unwrap().status, Status::KeyNotFound);
    }

    #[test]
    fn test_batch_get() {
        let mut codec = TextCodec::new(Limits::new());
        let mut out = BytesMut::new();
        codec
            .encode(
                &Request::GetBatch {
                    keys: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(out.as_ref(), b"gets a b\r\n");

        let response = feed(&mut codec, "VALUE a 0 1 1\r\nx\r\nEND\r\n")
            .unwrap()
            .unwrap();
        let Response::Batch(hits) = response else {
            panic!("expected batch");
        };
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key.as_ref(), b"a");
    }

    #[test]
    fn test_partial_value_block_not_consumed() {
        let mut codec = TextCodec::new(Limits::new());
        codec
            .encode(
                &Request::Get {
                    key: Bytes::from_static(b"k"),
                },
                &mut BytesMut::new(),
            )
            .unwrap();

        let mut buf = BytesMut::from(&b"VALUE k 0 5 1\r\nhel"[..]);
        let before = buf.len();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), before);

        buf.extend_from_slice(b"lo\r\nEND\r\n");
        let response = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(response.into_one().unwrap().body.as_ref(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_delta_replies() {
        let mut codec = TextCodec::new(Limits::new());
        codec
            .encode(
                &Request::Delta {
                    direction: crate::message::DeltaDirection::Increment,
                    key: Bytes::from_static(b"n"),
                    delta: 2,
                    initial: 0,
                    expiration: 0,
                },
                &mut BytesMut::new(),
            )
            .unwrap();
        let response = feed(&mut codec, "7\r\n").unwrap().unwrap();
        assert_eq!(response.into_one().unwrap().counter(), Some(7));

        codec
            .encode(
                &Request::Delta {
                    direction: crate::message::DeltaDirection::Increment,
                    key: Bytes::from_static(b"gone"),
                    delta: 1,
                    initial: 0,
                    expiration: 0,
                },
                &mut BytesMut::new(),
            )
            .unwrap();
        let response = feed(&mut codec, "NOT_FOUND\r\n").unwrap().unwrap();
        assert_eq!(response.into_one().unwrap().status, Status::KeyNotFound);
    }

    #[test]
    fn test_stats_block() {
        let mut codec = TextCodec::new(Limits::new());
        codec
            .encode(&Request::Stats { key: None }, &mut BytesMut::new())
            .unwrap();
        let response = feed(&mut codec, "STAT pid 42\r\nSTAT uptime 9\r\nEND\r\n")
            .unwrap()
            .unwrap();
        let Response::Stats(table) = response else {
            panic!("expected stats");
        };
        assert_eq!(table[0], ("pid".to_string(), "42".to_string()));
        assert_eq!(table[1], ("uptime".to_string(), "9".to_string()));
    }

    #[test]
    fn test_error_lines() {
        let mut codec = TextCodec::new(Limits::new());
        codec
            .encode(
                &Request::Delete {
                    key: Bytes::from_static(b"k"),
                    cas: 0,
                },
                &mut BytesMut::new(),
            )
            .unwrap();
        let response = feed(&mut codec, "CLIENT_ERROR bad data chunk\r\n")
            .unwrap()
            .unwrap();
        let reply = response.into_one().unwrap();
        assert_eq!(reply.status, Status::InvalidArguments);
        assert_eq!(reply.text().unwrap(), "bad data chunk");
    }

    #[test]
    fn test_sasl_unsupported() {
        let mut codec = TextCodec::new(Limits::new());
        let err = codec
            .encode(&Request::SaslListMechs, &mut BytesMut::new())
            .unwrap_err();
        assert!(matches!(err, ProtoError::Unsupported { .. }));
    }
}

//! The binary dialect codec.
//!
//! One `BinaryCodec` belongs to one socket. Encoding a request appends the
//! packet bytes to the outbound buffer and pushes an expectation; decoding
//! pairs each incoming frame against the front expectation by opaque.
//! Because a socket is held by one operation at a time, expectations form a
//! strict FIFO and any mismatch is a protocol violation.
//!
//! # Batch gets
//!
//! `Request::GetBatch` becomes one `GetKQ` packet per key followed by a
//! single `Noop`. Quiet gets reply only on hits, each echoing its key; the
//! `Noop` reply delimits the batch. The decoder tracks the issued opaques
//! and checks that hit replies arrive as an ordered subsequence of them.

use std::collections::VecDeque;
use std::mem;

use bytes::BytesMut;
use ember_core::Limits;

use crate::codec::OperationCodec;
use crate::error::{ProtoError, ProtoResult};
use crate::header::{read_response_frame, write_request, ResponseFrame};
use crate::message::{Reply, Request, Response};
use crate::opcode::Opcode;

/// What the codec is waiting for, oldest first.
#[derive(Debug)]
enum Pending {
    /// A single reply packet.
    One {
        opcode: Opcode,
        opaque: u32,
    },
    /// A quiet-get pipeline: hit replies, then the Noop terminator.
    Batch {
        issued: VecDeque<u32>,
        terminator: u32,
        collected: Vec<Reply>,
    },
    /// A stats stream terminated by an empty-key packet.
    Stats {
        opaque: u32,
        collected: Vec<(String, String)>,
    },
}

/// Stateful binary protocol codec for one socket.
#[derive(Debug)]
pub struct BinaryCodec {
    limits: Limits,
    opaque: u32,
    pending: VecDeque<Pending>,
}

impl BinaryCodec {
    /// Creates a codec with the given frame limits.
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            opaque: 0,
            pending: VecDeque::new(),
        }
    }

    fn next_opaque(&mut self) -> u32 {
        self.opaque = self.opaque.wrapping_add(1);
        self.opaque
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

    fn encode_request(&mut self, request: &Request, buf: &mut BytesMut) -> ProtoResult<()> {
        match request {
            Request::Get { key } => {
                let opaque = self.next_opaque();
                write_request(buf, Opcode::Get, opaque, 0, &[], key, &[]);
                self.pending.push_back(Pending::One {
                    opcode: Opcode::Get,
                    opaque,
                });
            }
            Request::GetBatch { keys } => {
                let mut issued = VecDeque::with_capacity(keys.len());
                for key in keys {
                    let opaque = self.next_opaque();
                    write_request(buf, Opcode::GetKQ, opaque, 0, &[], key, &[]);
                    issued.push_back(opaque);
                }
                let terminator = self.next_opaque();
                write_request(buf, Opcode::Noop, terminator, 0, &[], &[], &[]);
                self.pending.push_back(Pending::Batch {
                    issued,
                    terminator,
                    collected: Vec::new(),
                });
            }
            Request::Store {
                mode,
                key,
                payload,
                expiration,
                cas,
            } => {
                self.check_body(payload.data.len())?;
                let mut extras = [0u8; 8];
                extras[..4].copy_from_slice(&payload.flags.to_be_bytes());
                extras[4..].copy_from_slice(&expiration.to_be_bytes());
                let opaque = self.next_opaque();
                let opcode = mode.opcode();
                write_request(buf, opcode, opaque, *cas, &extras, key, &payload.data);
                self.pending.push_back(Pending::One { opcode, opaque });
            }
            Request::Concat {
                direction,
                key,
                data,
                cas,
            } => {
                self.check_body(data.len())?;
                let opaque = self.next_opaque();
                let opcode = direction.opcode();
                write_request(buf, opcode, opaque, *cas, &[], key, data);
                self.pending.push_back(Pending::One { opcode, opaque });
            }
            Request::Delta {
                direction,
                key,
                delta,
                initial,
                expiration,
            } => {
                let mut extras = [0u8; 20];
                extras[..8].copy_from_slice(&delta.to_be_bytes());
                extras[8..16].copy_from_slice(&initial.to_be_bytes());
                extras[16..].copy_from_slice(&expiration.to_be_bytes());
                let opaque = self.next_opaque();
                let opcode = direction.opcode();
                write_request(buf, opcode, opaque, 0, &extras, key, &[]);
                self.pending.push_back(Pending::One { opcode, opaque });
            }
            Request::Delete { key, cas } => {
                let opaque = self.next_opaque();
                write_request(buf, Opcode::Delete, opaque, *cas, &[], key, &[]);
                self.pending.push_back(Pending::One {
                    opcode: Opcode::Delete,
                    opaque,
                });
            }
            Request::Flush { delay } => {
                let opaque = self.next_opaque();
                if *delay == 0 {
                    write_request(buf, Opcode::Flush, opaque, 0, &[], &[], &[]);
                } else {
                    write_request(buf, Opcode::Flush, opaque, 0, &delay.to_be_bytes(), &[], &[]);
                }
                self.pending.push_back(Pending::One {
                    opcode: Opcode::Flush,
                    opaque,
                });
            }
            Request::Stats { key } => {
                let opaque = self.next_opaque();
                let key = key.as_deref().unwrap_or(&[]);
                write_request(buf, Opcode::Stat, opaque, 0, &[], key, &[]);
                self.pending.push_back(Pending::Stats {
                    opaque,
                    collected: Vec::new(),
                });
            }
            Request::Version => {
                let opaque = self.next_opaque();
                write_request(buf, Opcode::Version, opaque, 0, &[], &[], &[]);
                self.pending.push_back(Pending::One {
                    opcode: Opcode::Version,
                    opaque,
                });
            }
            Request::Noop => {
                let opaque = self.next_opaque();
                write_request(buf, Opcode::Noop, opaque, 0, &[], &[], &[]);
                self.pending.push_back(Pending::One {
                    opcode: Opcode::Noop,
                    opaque,
                });
            }
            Request::Quit => {
                let opaque = self.next_opaque();
                write_request(buf, Opcode::Quit, opaque, 0, &[], &[], &[]);
                self.pending.push_back(Pending::One {
                    opcode: Opcode::Quit,
                    opaque,
                });
            }
            Request::SaslListMechs => {
                let opaque = self.next_opaque();
                write_request(buf, Opcode::SaslListMechs, opaque, 0, &[], &[], &[]);
                self.pending.push_back(Pending::One {
                    opcode: Opcode::SaslListMechs,
                    opaque,
                });
            }
            Request::SaslAuth { mechanism, data } => {
                let opaque = self.next_opaque();
                write_request(buf, Opcode::SaslAuth, opaque, 0, &[], mechanism.as_bytes(), data);
                self.pending.push_back(Pending::One {
                    opcode: Opcode::SaslAuth,
                    opaque,
                });
            }
            Request::SaslStep { mechanism, data } => {
                let opaque = self.next_opaque();
                write_request(buf, Opcode::SaslStep, opaque, 0, &[], mechanism.as_bytes(), data);
                self.pending.push_back(Pending::One {
                    opcode: Opcode::SaslStep,
                    opaque,
                });
            }
        }
        Ok(())
    }

    /// Feeds one frame into the front expectation.
    fn accept(&mut self, frame: ResponseFrame) -> ProtoResult<Option<Response>> {
        let Some(pending) = self.pending.front_mut() else {
            return Err(ProtoError::UnexpectedResponse {
                reason: "no outstanding request",
            });
        };

        match pending {
            Pending::One { opcode, opaque } => {
                if frame.header.opaque != *opaque {
                    return Err(ProtoError::OpaqueMismatch {
                        expected: *opaque,
                        actual: frame.header.opaque,
                    });
                }
                if frame.header.opcode != *opcode {
                    return Err(ProtoError::UnexpectedResponse {
                        reason: "opcode echo does not match request",
                    });
                }
                let reply = reply_from(frame);
                self.pending.pop_front();
                Ok(Some(Response::One(reply)))
            }
            Pending::Batch {
                issued,
                terminator,
                collected,
            } => match frame.header.opcode {
                Opcode::GetKQ => {
                    // Hit replies arrive as an ordered subsequence of the
                    // issued opaques; everything skipped over was a miss.
                    loop {
                        match issued.pop_front() {
                            Some(opaque) if opaque == frame.header.opaque => break,
                            Some(_) => {}
                            None => {
                                return Err(ProtoError::UnexpectedResponse {
                                    reason: "quiet get reply with unknown opaque",
                                })
                            }
                        }
                    }
                    if frame.header.status.is_success() {
                        collected.push(reply_from(frame));
                    }
                    Ok(None)
                }
                Opcode::Noop => {
                    if frame.header.opaque != *terminator {
                        return Err(ProtoError::OpaqueMismatch {
                            expected: *terminator,
                            actual: frame.header.opaque,
                        });
                    }
                    let hits = mem::take(collected);
                    self.pending.pop_front();
                    Ok(Some(Response::Batch(hits)))
                }
                _ => Err(ProtoError::UnexpectedResponse {
                    reason: "non-quiet reply inside a batch pipeline",
                }),
            },
            Pending::Stats { opaque, collected } => {
                if frame.header.opaque != *opaque {
                    return Err(ProtoError::OpaqueMismatch {
                        expected: *opaque,
                        actual: frame.header.opaque,
                    });
                }
                if frame.header.opcode != Opcode::Stat {
                    return Err(ProtoError::UnexpectedResponse {
                        reason: "non-stat reply inside a stats stream",
                    });
                }
                if frame.key.is_empty() {
                    // Empty key terminates the stream.
                    let table = mem::take(collected);
                    self.pending.pop_front();
                    return Ok(Some(Response::Stats(table)));
                }
                collected.push((
                    String::from_utf8_lossy(&frame.key).into_owned(),
                    String::from_utf8_lossy(&frame.value).into_owned(),
                ));
                Ok(None)
            }
        }
    }
}

impl OperationCodec for BinaryCodec {
    fn encode(&mut self, request: &Request, buf: &mut BytesMut) -> ProtoResult<()> {
        self.encode_request(request, buf)
    }

    fn decode(&mut self, buf: &mut BytesMut) -> ProtoResult<Option<Response>> {
        loop {
            let Some(frame) = read_response_frame(buf, &self.limits)? else {
                return Ok(None);
            };
            if let Some(response) = self.accept(frame)? {
                return Ok(Some(response));
            }
        }
    }
}

fn reply_from(frame: ResponseFrame) -> Reply {
    let flags = if frame.extras.len() >= 4 {
        u32::from_be_bytes([
            frame.extras[0],
            frame.extras[1],
            frame.extras[2],
            frame.extras[3],
        ])
    } else {
        0
    };
    Reply {
        status: frame.header.status,
        cas: frame.header.cas,
        flags,
        key: frame.key,
        body: frame.value,
    }
}

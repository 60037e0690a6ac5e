//! One pooled TCP connection.
//!
//! A connection owns the stream, its read buffer, and a codec instance.
//! All work on a connection is serialized by the pool: exactly one
//! operation writes, then reads until the codec yields the response. Any
//! transport or protocol error leaves the connection unusable; the pool
//! destroys it instead of returning it.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::AuthConfig;
use crate::error::{ClientError, ClientResult};
use ember_core::{Limits, MAX_SASL_STEPS};
use ember_proto::{OperationCodec, ProtoError, Protocol, Reply, Request, Response, Status};

/// TCP keepalive idle time for pooled sockets.
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// A connected, authenticated socket.
pub(crate) struct Connection {
    stream: TcpStream,
    codec: Box<dyn OperationCodec>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    label: Arc<str>,
    receive_timeout: Duration,
    max_read_buffer: usize,
}

impl Connection {
    /// Opens, configures, and (when credentials are present)
    /// authenticates a new socket to `label`.
    ///
    /// DNS resolution happens here, lazily, on every connect.
    pub(crate) async fn open(
        label: Arc<str>,
        protocol: Protocol,
        limits: Limits,
        connect_timeout: Duration,
        receive_timeout: Duration,
        auth: Option<&AuthConfig>,
    ) -> ClientResult<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(&*label))
            .await
            .map_err(|_| ClientError::ConnectTimeout {
                addr: label.to_string(),
                timeout_ms: millis(connect_timeout),
            })??;

        stream.set_nodelay(true)?;
        let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

        let mut connection = Self {
            stream,
            codec: protocol.codec(limits),
            read_buf: BytesMut::with_capacity(4 * 1024),
            write_buf: BytesMut::with_capacity(1024),
            label,
            receive_timeout,
            max_read_buffer: limits.max_read_buffer_bytes as usize,
        };

        if let Some(auth) = auth {
            connection.authenticate(auth).await?;
        }

        debug!(node = %connection.label, "socket opened");
        Ok(connection)
    }

    /// Writes one request and reads until the codec yields its response.
    pub(crate) async fn call(&mut self, request: &Request) -> ClientResult<Response> {
        self.write_buf.clear();
        self.codec.encode(request, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;

        loop {
            if let Some(response) = self.codec.decode(&mut self.read_buf)? {
                return Ok(response);
            }
            if self.read_buf.len() > self.max_read_buffer {
                return Err(ClientError::Protocol(ProtoError::FrameTooLarge {
                    size: self.read_buf.len() as u64,
                    max: u32::try_from(self.max_read_buffer).unwrap_or(u32::MAX),
                }));
            }
            let read = timeout(self.receive_timeout, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| ClientError::ReadTimeout {
                    addr: self.label.to_string(),
                    timeout_ms: millis(self.receive_timeout),
                })??;
            if read == 0 {
                return Err(ClientError::ConnectionClosed {
                    addr: self.label.to_string(),
                });
            }
        }
    }

    /// Writes one request without waiting for a reply (shutdown Quit).
    pub(crate) async fn send_only(&mut self, request: &Request) -> ClientResult<()> {
        self.write_buf.clear();
        self.codec.encode(request, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Runs the SASL handshake on a fresh socket.
    ///
    /// SaslList, then SaslAuth, then SaslStep while the server answers
    /// AuthContinue, bounded by [`MAX_SASL_STEPS`]. Any other status fails
    /// socket creation.
    async fn authenticate(&mut self, auth: &AuthConfig) -> ClientResult<()> {
        let reply = self.one_reply(&Request::SaslListMechs).await?;
        if !reply.status.is_success() {
            return Err(ClientError::AuthFailed {
                reason: format!("mechanism list refused: {}", reply.status),
            });
        }
        let offered = String::from_utf8_lossy(&reply.body).into_owned();
        if !offered
            .split_whitespace()
            .any(|m| m.eq_ignore_ascii_case(&auth.mechanism))
        {
            return Err(ClientError::AuthFailed {
                reason: format!("server offers [{offered}], not {}", auth.mechanism),
            });
        }

        let mut reply = self
            .one_reply(&Request::SaslAuth {
                mechanism: auth.mechanism.clone(),
                data: auth.initial_response(),
            })
            .await?;

        let mut steps = 0;
        loop {
            match reply.status {
                Status::NoError => {
                    debug!(node = %self.label, mechanism = %auth.mechanism, "authenticated");
                    return Ok(());
                }
                Status::AuthContinue => {
                    steps += 1;
                    if steps > MAX_SASL_STEPS {
                        return Err(ClientError::AuthFailed {
                            reason: format!("handshake exceeded {MAX_SASL_STEPS} steps"),
                        });
                    }
                    reply = self
                        .one_reply(&Request::SaslStep {
                            mechanism: auth.mechanism.clone(),
                            data: reply.body.clone(),
                        })
                        .await?;
                }
                other => {
                    return Err(ClientError::AuthFailed {
                        reason: format!("server answered {other}"),
                    })
                }
            }
        }
    }

    async fn one_reply(&mut self, request: &Request) -> ClientResult<Reply> {
        self.call(request)
            .await?
            .into_one()
            .ok_or(ClientError::Protocol(ProtoError::UnexpectedResponse {
                reason: "multi-part reply to a single-packet request",
            }))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

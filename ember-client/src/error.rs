//! Client error types.

use thiserror::Error;

use crate::config::ConfigError;
use crate::transcoder::TranscodeError;
use ember_proto::ProtoError;

/// Errors raised by the client stack.
///
/// Server status codes are not errors: they surface through
/// [`OperationResult`](crate::OperationResult) with the protocol code
/// verbatim. These variants cover everything that goes wrong on this side
/// of the wire, or on the wire itself.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The configuration failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A key failed protocol validation after transformation.
    #[error(transparent)]
    Key(#[from] ember_core::Error),

    /// The locator found no live node for the key.
    #[error("no available node")]
    NodeUnavailable,

    /// Every socket was busy for the whole queue timeout.
    #[error("socket pool exhausted for {node} after {waited_ms} ms")]
    PoolExhausted {
        /// The node whose pool was exhausted.
        node: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// TCP connect did not finish within the connect timeout.
    #[error("connect to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout {
        /// The endpoint being connected.
        addr: String,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// A socket read did not finish within the receive timeout.
    #[error("read from {addr} timed out after {timeout_ms} ms")]
    ReadTimeout {
        /// The endpoint being read.
        addr: String,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// The server closed the connection mid-operation.
    #[error("connection closed by {addr}")]
    ConnectionClosed {
        /// The endpoint that closed.
        addr: String,
    },

    /// An I/O error on a socket.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream violated the protocol.
    #[error(transparent)]
    Protocol(#[from] ProtoError),

    /// The SASL handshake failed.
    #[error("authentication failed: {reason}")]
    AuthFailed {
        /// What went wrong.
        reason: String,
    },

    /// A value failed to encode or decode.
    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    /// The expiration input was rejected before hitting the wire.
    #[error("invalid expiration: {reason}")]
    InvalidExpiration {
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The client is shut down.
    #[error("client is shut down")]
    Shutdown,
}

impl ClientError {
    /// Whether this failure means the socket carried it is unusable and
    /// its node must be marked dead.
    ///
    /// Local conditions (pool exhaustion, bad keys, auth refusals) leave
    /// the node alive; transport and protocol failures do not.
    pub(crate) fn poisons_node(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. }
                | Self::ReadTimeout { .. }
                | Self::ConnectionClosed { .. }
                | Self::Io(_)
                | Self::Protocol(_)
        )
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

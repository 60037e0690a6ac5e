//! Ember Client - An async memcached client.
//!
//! The client fans requests out over a pool of independent cache nodes:
//! keys are transformed and validated, located on a consistent-hash ring,
//! and dispatched on pooled TCP sockets speaking the binary protocol (or
//! the text dialect). Values round-trip through a pluggable transcoder
//! that tags every payload with a 32-bit type flag.
//!
//! # Example
//!
//! ```ignore
//! use ember_client::{CacheClient, ClientConfig, Expiration};
//!
//! let client = CacheClient::connect(ClientConfig::new([
//!     "cache-1.internal:11211",
//!     "cache-2.internal:11211",
//! ]))
//! .await?;
//!
//! client.set("greeting", "hello", Expiration::Never).await;
//! let result = client.get("greeting").await;
//! assert_eq!(result.value().and_then(|v| v.as_str()), Some("hello"));
//! ```
//!
//! # Failure model
//!
//! Operations answer with an [`OperationResult`] instead of an error type:
//! server status codes travel verbatim, local failures (pool exhaustion,
//! dead nodes, timeouts) carry a message, and nothing is ever retried.
//! A node that fails at the socket level goes dead, its keys rehash to
//! the surviving nodes, and a background probe revives it when it comes
//! back.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod config;
mod connection;
mod error;
mod keys;
mod locator;
mod node;
mod pool;
mod results;
mod server_pool;
mod transcoder;

pub use client::{CacheClient, Expiration};
pub use config::{
    AuthConfig, ClientConfig, ConfigError, LocatorKind, SocketPoolConfig, TranscoderKind,
};
pub use error::{ClientError, ClientResult};
pub use keys::KeyTransformer;
pub use locator::{KetamaLocator, NodeLocator, NodeView, SingleNodeLocator};
pub use results::OperationResult;
pub use transcoder::{DefaultTranscoder, TranscodeError, Transcoder, Value};

pub use ember_core::{Limits, NodeId, Payload};
pub use ember_proto::{Protocol, Status, StoreMode};

//! Client configuration.
//!
//! A [`ClientConfig`] names the servers and selects the pluggable pieces:
//! wire protocol, socket-pool bounds and timeouts, authentication, key
//! transformer, transcoder, and node locator. The pluggable pieces are
//! tagged variants with a `Custom` escape hatch instead of reflective
//! construction; configuration picks a variant, the client builds it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::keys::KeyTransformer;
use crate::locator::{KetamaLocator, NodeLocator, SingleNodeLocator};
use crate::transcoder::{DefaultTranscoder, Transcoder};
use ember_core::Limits;
use ember_proto::Protocol;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The server list is empty.
    #[error("no servers configured")]
    NoServers,

    /// Pool bounds are inconsistent.
    #[error("invalid pool bounds: min {min} > max {max}")]
    PoolBounds {
        /// Configured minimum.
        min: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The pool must allow at least one socket.
    #[error("max_pool_size must be at least 1")]
    ZeroPool,

    /// A timeout that must be non-zero was zero.
    #[error("{which} must be non-zero")]
    ZeroTimeout {
        /// Which timeout was zero.
        which: &'static str,
    },

    /// SASL authentication only exists on the binary protocol.
    #[error("authentication requires the binary protocol")]
    AuthRequiresBinary,
}

/// Per-node socket pool tuning.
#[derive(Debug, Clone)]
pub struct SocketPoolConfig {
    /// Sockets opened per node at warm-up.
    pub min_pool_size: usize,
    /// Maximum open sockets per node.
    pub max_pool_size: usize,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-read timeout while waiting on a response.
    pub receive_timeout: Duration,
    /// How long an acquire waits for a free socket before failing.
    pub queue_timeout: Duration,
    /// How long a dead node rests before a revival probe.
    pub dead_timeout: Duration,
}

impl SocketPoolConfig {
    /// Creates the default pool configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            min_pool_size: 2,
            max_pool_size: 10,
            connect_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(10),
            queue_timeout: Duration::from_secs(1),
            dead_timeout: Duration::from_secs(10),
        }
    }

    /// Creates a small, fast-failing pool for tests.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            min_pool_size: 1,
            max_pool_size: 4,
            connect_timeout: Duration::from_millis(500),
            receive_timeout: Duration::from_secs(2),
            queue_timeout: Duration::from_millis(250),
            dead_timeout: Duration::from_millis(500),
        }
    }
}

impl Default for SocketPoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// SASL credentials.
#[derive(Clone)]
pub struct AuthConfig {
    /// Mechanism name; PLAIN is the one this client implements.
    pub mechanism: String,
    /// Authentication identity.
    pub username: String,
    /// Password.
    pub password: String,
}

impl AuthConfig {
    /// PLAIN credentials.
    #[must_use]
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            mechanism: "PLAIN".to_string(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// The initial SASL response: `\0authcid\0password`.
    #[must_use]
    pub fn initial_response(&self) -> Bytes {
        let mut blob = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        blob.push(0);
        blob.extend_from_slice(self.username.as_bytes());
        blob.push(0);
        blob.extend_from_slice(self.password.as_bytes());
        Bytes::from(blob)
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print credentials.
        f.debug_struct("AuthConfig")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Which transcoder the client uses.
#[derive(Debug, Clone, Default)]
pub enum TranscoderKind {
    /// The fixed-flag-table default.
    #[default]
    Default,
    /// A caller-supplied transcoder.
    Custom(Arc<dyn Transcoder>),
}

impl TranscoderKind {
    pub(crate) fn build(&self) -> Arc<dyn Transcoder> {
        match self {
            Self::Default => Arc::new(DefaultTranscoder),
            Self::Custom(t) => Arc::clone(t),
        }
    }
}

/// Which node locator the client uses.
#[derive(Debug, Clone, Default)]
pub enum LocatorKind {
    /// The ketama consistent-hash ring.
    #[default]
    ConsistentHash,
    /// The single-node short circuit.
    SingleNode,
    /// A caller-supplied locator.
    Custom(Arc<dyn NodeLocator>),
}

impl LocatorKind {
    /// Builds the locator; a one-server consistent-hash configuration
    /// collapses to the single-node short circuit.
    pub(crate) fn build(&self, server_count: usize) -> Arc<dyn NodeLocator> {
        match self {
            Self::ConsistentHash if server_count > 1 => Arc::new(KetamaLocator::new()),
            Self::ConsistentHash | Self::SingleNode => Arc::new(SingleNodeLocator::new()),
            Self::Custom(locator) => Arc::clone(locator),
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server endpoints, `host:port`; hostnames resolve at connect time.
    pub servers: Vec<String>,
    /// Wire dialect.
    pub protocol: Protocol,
    /// Socket pool tuning, shared by every node.
    pub pool: SocketPoolConfig,
    /// SASL credentials, when the cluster requires them.
    pub authentication: Option<AuthConfig>,
    /// Application-key to protocol-key mapping.
    pub key_transformer: KeyTransformer,
    /// Value transcoding.
    pub transcoder: TranscoderKind,
    /// Key-to-node location.
    pub locator: LocatorKind,
    /// Frame and buffer limits.
    pub limits: Limits,
}

impl ClientConfig {
    /// Creates a configuration for the given servers with defaults
    /// everywhere else.
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            protocol: Protocol::Binary,
            pool: SocketPoolConfig::new(),
            authentication: None,
            key_transformer: KeyTransformer::Identity,
            transcoder: TranscoderKind::Default,
            locator: LocatorKind::ConsistentHash,
            limits: Limits::new(),
        }
    }

    /// A single-server configuration with fast test timeouts.
    #[must_use]
    pub fn for_testing(server: impl Into<String>) -> Self {
        let mut config = Self::new([server.into()]);
        config.pool = SocketPoolConfig::for_testing();
        config.limits = Limits::for_testing();
        config
    }

    /// Sets the wire dialect.
    #[must_use]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the pool configuration.
    #[must_use]
    pub fn with_pool(mut self, pool: SocketPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets SASL credentials.
    #[must_use]
    pub fn with_authentication(mut self, auth: AuthConfig) -> Self {
        self.authentication = Some(auth);
        self
    }

    /// Sets the key transformer.
    #[must_use]
    pub fn with_key_transformer(mut self, transformer: KeyTransformer) -> Self {
        self.key_transformer = transformer;
        self
    }

    /// Sets the transcoder.
    #[must_use]
    pub fn with_transcoder(mut self, transcoder: TranscoderKind) -> Self {
        self.transcoder = transcoder;
        self
    }

    /// Sets the node locator.
    #[must_use]
    pub fn with_locator(mut self, locator: LocatorKind) -> Self {
        self.locator = locator;
        self
    }

    /// Sets the frame and buffer limits.
    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        if self.pool.max_pool_size == 0 {
            return Err(ConfigError::ZeroPool);
        }
        if self.pool.min_pool_size > self.pool.max_pool_size {
            return Err(ConfigError::PoolBounds {
                min: self.pool.min_pool_size,
                max: self.pool.max_pool_size,
            });
        }
        for (which, timeout) in [
            ("connect_timeout", self.pool.connect_timeout),
            ("receive_timeout", self.pool.receive_timeout),
            ("queue_timeout", self.pool.queue_timeout),
            ("dead_timeout", self.pool.dead_timeout),
        ] {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroTimeout { which });
            }
        }
        if self.authentication.is_some() && !self.protocol.supports_auth() {
            return Err(ConfigError::AuthRequiresBinary);
        }
        Ok(())
    }
}

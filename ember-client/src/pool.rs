//! The per-node socket pool.
//!
//! Capacity is a semaphore with `max_pool_size` permits; idle sockets wait
//! in a deque. Acquire pops an idle socket or opens a fresh one under a
//! permit, waiting at most `queue_timeout` for a slot. Release returns
//! healthy sockets to the deque head; a socket that saw any error is
//! destroyed with its permit, never re-pooled.
//!
//! The deque carries a generation stamp. Draining (node death, shutdown)
//! bumps the generation, so sockets checked out before the drain cannot
//! sneak back into a deque that was just emptied.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};

use crate::config::{AuthConfig, SocketPoolConfig};
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use ember_core::Limits;
use ember_proto::{Protocol, Request, Response};

pub(crate) struct SocketPool {
    label: Arc<str>,
    protocol: Protocol,
    limits: Limits,
    auth: Option<AuthConfig>,
    config: SocketPoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Connection>>,
    generation: AtomicU64,
}

impl SocketPool {
    pub(crate) fn new(
        label: Arc<str>,
        protocol: Protocol,
        limits: Limits,
        auth: Option<AuthConfig>,
        config: SocketPoolConfig,
    ) -> Self {
        Self {
            label,
            protocol,
            limits,
            auth,
            semaphore: Arc::new(Semaphore::new(config.max_pool_size)),
            config,
            idle: Mutex::new(VecDeque::new()),
            generation: AtomicU64::new(0),
        }
    }

    async fn open_connection(&self) -> ClientResult<Connection> {
        Connection::open(
            Arc::clone(&self.label),
            self.protocol,
            self.limits,
            self.config.connect_timeout,
            self.config.receive_timeout,
            self.auth.as_ref(),
        )
        .await
    }

    /// Checks out a socket: idle first, then a fresh connect, then a
    /// bounded wait for somebody else's release.
    pub(crate) async fn acquire(self: &Arc<Self>) -> ClientResult<PooledConnection> {
        let started = Instant::now();
        let permit = match timeout(
            self.config.queue_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(ClientError::Shutdown),
            Err(_elapsed) => {
                return Err(ClientError::PoolExhausted {
                    node: self.label.to_string(),
                    waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                })
            }
        };

        let generation = self.generation.load(Ordering::Acquire);
        let idle = self
            .idle
            .lock()
            .expect("pool mutex poisoned")
            .pop_front();
        let connection = match idle {
            Some(connection) => connection,
            None => self.open_connection().await?, // permit drops on error
        };

        Ok(PooledConnection {
            pool: Arc::clone(self),
            connection: Some(connection),
            _permit: permit,
            generation,
            healthy: true,
        })
    }

    /// Opens the configured minimum of sockets up front.
    pub(crate) async fn warm(&self) -> ClientResult<()> {
        let generation = self.generation.load(Ordering::Acquire);
        for _ in 0..self.config.min_pool_size {
            let connection = self.open_connection().await?;
            self.stash(connection, generation);
        }
        Ok(())
    }

    /// Opens a single socket to test the node, idling it on success.
    pub(crate) async fn probe(&self) -> ClientResult<()> {
        let generation = self.generation.load(Ordering::Acquire);
        let connection = self.open_connection().await?;
        self.stash(connection, generation);
        Ok(())
    }

    /// Returns a socket to the idle deque, unless the pool was drained
    /// after the socket was checked out.
    fn stash(&self, connection: Connection, generation: u64) {
        if self.generation.load(Ordering::Acquire) == generation {
            self.idle
                .lock()
                .expect("pool mutex poisoned")
                .push_front(connection);
        }
    }

    /// Empties the idle deque and invalidates outstanding checkouts'
    /// right to return. The drained sockets are handed back so shutdown
    /// can say goodbye on them.
    pub(crate) fn drain(&self) -> Vec<Connection> {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut idle = self.idle.lock().expect("pool mutex poisoned");
        idle.drain(..).collect()
    }

    /// Drains and permanently closes the pool; later acquires fail.
    pub(crate) fn close(&self) -> Vec<Connection> {
        self.semaphore.close();
        self.drain()
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().expect("pool mutex poisoned").len()
    }
}

/// A checked-out socket; returns itself to the pool on drop.
pub(crate) struct PooledConnection {
    pool: Arc<SocketPool>,
    connection: Option<Connection>,
    _permit: OwnedSemaphorePermit,
    generation: u64,
    healthy: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("generation", &self.generation)
            .field("healthy", &self.healthy)
            .finish()
    }
}

impl PooledConnection {
    /// Runs one request on the socket. Any error poisons the socket.
    pub(crate) async fn call(&mut self, request: &Request) -> ClientResult<Response> {
        let connection = self.connection.as_mut().expect("connection present");
        let result = connection.call(request).await;
        if result.is_err() {
            self.healthy = false;
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if self.healthy {
                self.pool.stash(connection, self.generation);
            }
            // Poisoned sockets just drop; the permit frees the slot.
        }
    }
}

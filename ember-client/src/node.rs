//! One server node: endpoint, pool, health.
//!
//! A node is Alive until a socket-level failure marks it Dead; dead nodes
//! rest for `dead_timeout` before the server pool probes them with a
//! single fresh socket. Health transitions are announced on an event
//! channel so the orchestrator can rebuild the locator without nodes and
//! locator holding references to each other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::ClientResult;
use crate::locator::NodeView;
use crate::pool::SocketPool;
use ember_core::NodeId;
use ember_proto::{Request, Response};

/// Node health state.
#[derive(Debug, Clone, Copy)]
enum Health {
    Alive,
    Dead { since: Instant, deadline: Instant },
}

pub(crate) struct Node {
    id: NodeId,
    label: Arc<str>,
    pool: Arc<SocketPool>,
    health: Mutex<Health>,
    events: mpsc::UnboundedSender<NodeId>,
    dead_timeout: Duration,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        server: &str,
        config: &ClientConfig,
        events: mpsc::UnboundedSender<NodeId>,
    ) -> Self {
        let label: Arc<str> = Arc::from(server);
        let pool = Arc::new(SocketPool::new(
            Arc::clone(&label),
            config.protocol,
            config.limits,
            config.authentication.clone(),
            config.pool.clone(),
        ));
        Self {
            id,
            label,
            pool,
            health: Mutex::new(Health::Alive),
            events,
            dead_timeout: config.pool.dead_timeout,
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn view(&self) -> NodeView {
        NodeView {
            id: self.id,
            label: self.label.to_string(),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        matches!(*self.health.lock().expect("health lock poisoned"), Health::Alive)
    }

    /// Runs one request on a pooled socket.
    ///
    /// Socket-level failures mark the node dead on the way out; server
    /// status codes are not failures and come back inside the response.
    pub(crate) async fn execute(&self, request: &Request) -> ClientResult<Response> {
        let mut connection = match self.pool.acquire().await {
            Ok(connection) => connection,
            Err(error) => {
                if error.poisons_node() {
                    self.mark_dead();
                }
                return Err(error);
            }
        };
        match connection.call(request).await {
            Ok(response) => Ok(response),
            Err(error) => {
                // The pooled socket already poisoned itself.
                if error.poisons_node() {
                    self.mark_dead();
                }
                Err(error)
            }
        }
    }

    /// Opens the pool's minimum sockets.
    pub(crate) async fn warm(&self) -> ClientResult<()> {
        self.pool.warm().await
    }

    pub(crate) fn mark_dead(&self) {
        let mut health = self.health.lock().expect("health lock poisoned");
        if matches!(*health, Health::Alive) {
            let now = Instant::now();
            *health = Health::Dead {
                since: now,
                deadline: now + self.dead_timeout,
            };
            drop(health);
            warn!(node = %self.label, "node marked dead");
            // Idle sockets on a dead node are all suspect.
            drop(self.pool.drain());
            let _ = self.events.send(self.id);
        }
    }

    fn mark_alive(&self) {
        let mut health = self.health.lock().expect("health lock poisoned");
        if let Health::Dead { since, .. } = *health {
            *health = Health::Alive;
            drop(health);
            info!(
                node = %self.label,
                down_ms = since.elapsed().as_millis() as u64,
                "node revived"
            );
            let _ = self.events.send(self.id);
        }
    }

    /// Whether the dead-timeout rest period has elapsed.
    pub(crate) fn needs_probe(&self, now: Instant) -> bool {
        match *self.health.lock().expect("health lock poisoned") {
            Health::Alive => false,
            Health::Dead { deadline, .. } => now >= deadline,
        }
    }

    /// Opens one probe socket; success revives the node, failure resets
    /// the rest period.
    pub(crate) async fn probe(&self) {
        debug!(node = %self.label, "revival probe");
        match self.pool.probe().await {
            Ok(()) => self.mark_alive(),
            Err(error) => {
                debug!(node = %self.label, %error, "revival probe failed");
                let mut health = self.health.lock().expect("health lock poisoned");
                if let Health::Dead { deadline, .. } = &mut *health {
                    *deadline = Instant::now() + self.dead_timeout;
                }
            }
        }
    }

    /// Drains and closes the pool, handing back idle sockets for a
    /// farewell Quit.
    pub(crate) fn close_pool(&self) -> Vec<Connection> {
        self.pool.close()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("alive", &self.is_alive())
            .finish()
    }
}

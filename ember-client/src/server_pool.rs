//! The server pool: owns every node and the locator.
//!
//! Dispatch is locate → node → pooled socket. Health transitions arrive on
//! an event channel and trigger an immediate locator rebuild; a background
//! maintenance task also probes dead nodes once their rest period ends.
//! Multi-get partitions keys by node and runs the per-node pipelines in
//! parallel; a node failing mid-pipeline degrades its keys to misses and
//! never to caller-visible errors.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::locator::{NodeLocator, NodeView};
use crate::node::Node;
use ember_core::NodeId;
use ember_proto::{Reply, Request, Response};

pub(crate) struct ServerPool {
    nodes: Vec<Arc<Node>>,
    locator: Arc<dyn NodeLocator>,
    batch_chunk: usize,
    probe_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerPool {
    /// Builds the nodes, warms their pools, and spawns the maintenance
    /// task. Nodes whose warm-up fails start dead and enter the revival
    /// cycle instead of failing the whole client.
    pub(crate) async fn start(config: &ClientConfig) -> ClientResult<Arc<Self>> {
        let locator = config.locator.build(config.servers.len());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut nodes = Vec::with_capacity(config.servers.len());
        for (index, server) in config.servers.iter().enumerate() {
            let id = NodeId::new(u32::try_from(index).unwrap_or(u32::MAX));
            nodes.push(Arc::new(Node::new(id, server, config, events_tx.clone())));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let probe_interval = config
            .pool
            .dead_timeout
            .clamp(Duration::from_millis(50), Duration::from_secs(1));

        let pool = Arc::new(Self {
            nodes,
            locator,
            batch_chunk: config.limits.max_batch_keys as usize,
            probe_interval,
            shutdown_tx,
        });

        for node in &pool.nodes {
            if let Err(error) = node.warm().await {
                // Auth refusals leave the node alive; only socket-level
                // failures start it in the revival cycle.
                if error.poisons_node() {
                    warn!(node = %node.label(), %error, "warm-up failed, node starts dead");
                    node.mark_dead();
                } else {
                    warn!(node = %node.label(), %error, "warm-up failed");
                }
            }
        }
        pool.rebuild_locator();

        let maintenance = Arc::clone(&pool);
        tokio::spawn(async move {
            maintenance.maintenance_loop(events_rx, shutdown_rx).await;
        });

        Ok(pool)
    }

    /// Rebuilds the locator from the current live-node view.
    fn rebuild_locator(&self) {
        let views: Vec<NodeView> = self
            .nodes
            .iter()
            .filter(|node| node.is_alive())
            .map(|node| node.view())
            .collect();
        debug!(live = views.len(), total = self.nodes.len(), "locator rebuilt");
        self.locator.rebuild(&views);
    }

    /// Reacts to health events and probes dead nodes.
    async fn maintenance_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<NodeId>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    if event.is_none() {
                        break;
                    }
                    // Coalesce a burst of transitions into one rebuild.
                    while events.try_recv().is_ok() {}
                    self.rebuild_locator();
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let due: Vec<Arc<Node>> = self
                        .nodes
                        .iter()
                        .filter(|node| node.needs_probe(now))
                        .cloned()
                        .collect();
                    if !due.is_empty() {
                        join_all(due.iter().map(|node| node.probe())).await;
                    }
                }
            }
        }
        debug!("maintenance loop stopped");
    }

    /// Dispatches one keyed request to its node.
    pub(crate) async fn execute(&self, key: &[u8], request: Request) -> ClientResult<Response> {
        let Some(id) = self.locator.locate(key) else {
            return Err(ClientError::NodeUnavailable);
        };
        // A custom locator could name a node this pool does not own.
        let node = self.nodes.get(id.index()).ok_or(ClientError::NodeUnavailable)?;
        node.execute(&request).await
    }

    /// Fans a batch get out across nodes and merges the hits.
    ///
    /// Keys on dead or failing nodes come back as misses, by contract.
    pub(crate) async fn get_batch(&self, keys: Vec<Bytes>) -> HashMap<Bytes, Reply> {
        let mut by_node: BTreeMap<u32, Vec<Bytes>> = BTreeMap::new();
        for key in keys {
            let Some(id) = self.locator.locate(&key) else {
                continue; // no live node: a miss
            };
            if id.index() < self.nodes.len() {
                by_node.entry(id.get()).or_default().push(key);
            }
        }

        let pipelines = by_node.into_iter().map(|(id, node_keys)| {
            let node = Arc::clone(&self.nodes[id as usize]);
            let chunk_size = self.batch_chunk.max(1);
            async move {
                let mut hits = Vec::new();
                for chunk in node_keys.chunks(chunk_size) {
                    match node.execute(&Request::GetBatch { keys: chunk.to_vec() }).await {
                        Ok(Response::Batch(replies)) => hits.extend(replies),
                        Ok(_) => {
                            debug!(node = %node.label(), "batch get paired with a non-batch response");
                            break;
                        }
                        Err(error) => {
                            debug!(node = %node.label(), %error, "batch pipeline failed, keys degrade to misses");
                            break;
                        }
                    }
                }
                hits
            }
        });

        join_all(pipelines)
            .await
            .into_iter()
            .flatten()
            .map(|reply| (reply.key.clone(), reply))
            .collect()
    }

    /// Runs one request on every live node.
    pub(crate) async fn broadcast(&self, request: &Request) -> Vec<(String, ClientResult<Response>)> {
        let live: Vec<Arc<Node>> = self
            .nodes
            .iter()
            .filter(|node| node.is_alive())
            .cloned()
            .collect();
        join_all(live.into_iter().map(|node| {
            let request = request.clone();
            async move {
                let label = node.label().to_string();
                let result = node.execute(&request).await;
                (label, result)
            }
        }))
        .await
    }

    /// Stops maintenance, closes every pool, and says a best-effort Quit
    /// on the idle sockets.
    pub(crate) fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for node in &self.nodes {
            for mut connection in node.close_pool() {
                tokio::spawn(async move {
                    let _ = connection.send_only(&Request::Quit).await;
                });
            }
        }
    }
}

impl std::fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPool")
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

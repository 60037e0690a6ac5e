//! Key-to-node location.
//!
//! The locator maps every key onto one live node and is rebuilt whenever
//! node health or membership changes. Rebuilds are atomic: lookups read an
//! immutable ring snapshot behind an `Arc`, so a reader never observes a
//! half-built ring.
//!
//! # Ketama ring
//!
//! Each live node contributes 160 virtual points. Point hashes come from
//! 40 md5 digests of `"{label}-{index}"`, each digest split into four
//! little-endian u32s (the libketama layout). Lookup hashes the key with
//! 32-bit FNV-1a and binary-searches for the first point at or above it,
//! wrapping to the first point past the top of the ring.

use std::fmt;
use std::sync::{Arc, RwLock};

use md5::{Digest, Md5};

use ember_core::{NodeId, RING_POINTS_PER_NODE};

/// One live node as the locator sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    /// The node's identifier.
    pub id: NodeId,
    /// The node's stable label, `host:port`.
    pub label: String,
}

/// Maps keys onto live nodes.
pub trait NodeLocator: Send + Sync + fmt::Debug {
    /// Replaces the live-node view atomically.
    fn rebuild(&self, nodes: &[NodeView]);

    /// Picks the node for a key, or `None` when no node is live.
    fn locate(&self, key: &[u8]) -> Option<NodeId>;
}

/// 32-bit FNV-1a, the protocol's key hash.
#[must_use]
pub(crate) fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811C_9DC5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// A sorted ring snapshot.
#[derive(Debug, Default)]
struct Ring {
    points: Vec<(u32, NodeId)>,
}

/// Finds the owning node: first point with hash >= target, wrapping.
fn search(points: &[(u32, NodeId)], hash: u32) -> Option<NodeId> {
    if points.is_empty() {
        return None;
    }
    let index = points.partition_point(|&(point, _)| point < hash);
    let index = if index == points.len() { 0 } else { index };
    Some(points[index].1)
}

/// The consistent-hash locator.
#[derive(Debug)]
pub struct KetamaLocator {
    ring: RwLock<Arc<Ring>>,
}

impl KetamaLocator {
    /// Creates an empty locator; every lookup misses until a rebuild.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ring: RwLock::new(Arc::new(Ring::default())),
        }
    }

    fn build_ring(nodes: &[NodeView]) -> Ring {
        let mut points = Vec::with_capacity(nodes.len() * RING_POINTS_PER_NODE);
        for node in nodes {
            for index in 0..RING_POINTS_PER_NODE / 4 {
                let digest = Md5::digest(format!("{}-{index}", node.label));
                for chunk in digest.chunks_exact(4) {
                    let hash = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.push((hash, node.id));
                }
            }
        }
        // Ties broken by id so any insertion order yields the same ring.
        points.sort_unstable();
        Ring { points }
    }

    fn snapshot(&self) -> Arc<Ring> {
        Arc::clone(&self.ring.read().expect("locator lock poisoned"))
    }
}

impl Default for KetamaLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeLocator for KetamaLocator {
    fn rebuild(&self, nodes: &[NodeView]) {
        let ring = Arc::new(Self::build_ring(nodes));
        *self.ring.write().expect("locator lock poisoned") = ring;
    }

    fn locate(&self, key: &[u8]) -> Option<NodeId> {
        let ring = self.snapshot();
        search(&ring.points, fnv1a_32(key))
    }
}

/// Short-circuit locator for single-server configurations.
///
/// No hashing, no ring: every key maps to the one node, or to nothing
/// while it is dead.
#[derive(Debug)]
pub struct SingleNodeLocator {
    node: RwLock<Option<NodeId>>,
}

impl SingleNodeLocator {
    /// Creates an empty locator; every lookup misses until a rebuild.
    #[must_use]
    pub fn new() -> Self {
        Self {
            node: RwLock::new(None),
        }
    }
}

impl Default for SingleNodeLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeLocator for SingleNodeLocator {
    fn rebuild(&self, nodes: &[NodeView]) {
        *self.node.write().expect("locator lock poisoned") = nodes.first().map(|n| n.id);
    }

    fn locate(&self, _key: &[u8]) -> Option<NodeId> {
        *self.node.read().expect("locator lock poisoned")
    }
}

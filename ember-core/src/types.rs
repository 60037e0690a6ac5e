//! Strongly-typed identifiers for ember entities.
//!
//! A `NodeId` names one configured server endpoint for the lifetime of a
//! client. Ids are assigned densely from 0 in configuration order, so they
//! double as indexes into the server pool's node table.

use std::fmt;

/// Unique identifier for a server node within one client instance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Creates a new ID from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the ID as a usize, for indexing the node table.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> Self {
        id.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_roundtrip() {
        let id = NodeId::new(7);
        assert_eq!(id.get(), 7);
        assert_eq!(id.index(), 7);
        assert_eq!(u32::from(id), 7);
        assert_eq!(NodeId::from(7u32), id);
    }

    #[test]
    fn test_node_id_display() {
        assert_eq!(format!("{}", NodeId::new(3)), "node-3");
        assert_eq!(format!("{:?}", NodeId::new(3)), "node(3)");
    }
}

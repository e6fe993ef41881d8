//! The transactional index: ordered key → operation-log map.

use crate::txn::op::{OpId, TransactionOperation};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};

/// Per-key container of overlay operations.
///
/// Operations are stored oldest → newest; traversals walk them in
/// reverse. The node's key is stable for the node's lifetime.
#[derive(Debug, Default)]
pub struct TransactionNode {
    ops: Vec<OpId>,
}

impl TransactionNode {
    /// Returns the newest operation.
    #[must_use]
    pub fn newest_op(&self) -> Option<OpId> {
        self.ops.last().copied()
    }

    /// Iterates operations newest → oldest.
    pub fn ops_newest_first(&self) -> impl Iterator<Item = OpId> + '_ {
        self.ops.iter().rev().copied()
    }

    /// Iterates operations oldest → newest.
    pub fn ops_oldest_first(&self) -> impl Iterator<Item = OpId> + '_ {
        self.ops.iter().copied()
    }

    /// Returns true if the node holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered mapping from key to [`TransactionNode`], plus the arena that
/// owns every live operation.
///
/// Key order uses the same byte comparator as the B-tree, so overlay
/// sibling navigation and B-tree navigation agree.
#[derive(Debug, Default)]
pub struct TransactionIndex {
    nodes: BTreeMap<Vec<u8>, TransactionNode>,
    ops: HashMap<OpId, TransactionOperation>,
    next_op: u64,
}

impl TransactionIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node for `key`, if one exists.
    #[must_use]
    pub fn node(&self, key: &[u8]) -> Option<&TransactionNode> {
        self.nodes.get(key)
    }

    /// Creates the node for `key` if missing; returns true if it was
    /// created by this call.
    pub fn ensure_node(&mut self, key: &[u8]) -> bool {
        if self.nodes.contains_key(key) {
            false
        } else {
            self.nodes.insert(key.to_vec(), TransactionNode::default());
            true
        }
    }

    /// Removes the node for `key` if it holds no operations.
    pub fn remove_node_if_empty(&mut self, key: &[u8]) {
        if self.nodes.get(key).is_some_and(TransactionNode::is_empty) {
            self.nodes.remove(key);
        }
    }

    /// Appends `op` to the node of its key and returns its id.
    ///
    /// The node must exist.
    pub fn append_op(&mut self, op: TransactionOperation) -> OpId {
        let id = OpId(self.next_op);
        self.next_op += 1;
        let node = self
            .nodes
            .get_mut(&op.key)
            .expect("node created before append");
        node.ops.push(id);
        self.ops.insert(id, op);
        id
    }

    /// Returns the operation with the given id.
    #[must_use]
    pub fn op(&self, id: OpId) -> Option<&TransactionOperation> {
        self.ops.get(&id)
    }

    /// Returns the operation with the given id, mutably.
    pub fn op_mut(&mut self, id: OpId) -> Option<&mut TransactionOperation> {
        self.ops.get_mut(&id)
    }

    /// Removes one operation from the arena and from its node.
    ///
    /// Returns the removed operation.
    pub fn remove_op(&mut self, id: OpId) -> Option<TransactionOperation> {
        let op = self.ops.remove(&id)?;
        if let Some(node) = self.nodes.get_mut(&op.key) {
            node.ops.retain(|o| *o != id);
            if node.ops.is_empty() {
                self.nodes.remove(&op.key);
            }
        }
        Some(op)
    }

    /// Returns the smallest key with a node.
    #[must_use]
    pub fn first_key(&self) -> Option<Vec<u8>> {
        self.nodes.keys().next().cloned()
    }

    /// Returns the largest key with a node.
    #[must_use]
    pub fn last_key(&self) -> Option<Vec<u8>> {
        self.nodes.keys().next_back().cloned()
    }

    /// Returns the smallest node key strictly greater than `key`.
    #[must_use]
    pub fn next_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.nodes
            .range::<[u8], _>((Excluded(key), Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    /// Returns the largest node key strictly smaller than `key`.
    #[must_use]
    pub fn prev_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.nodes
            .range::<[u8], _>((Unbounded, Excluded(key)))
            .next_back()
            .map(|(k, _)| k.clone())
    }

    /// Returns true if any node key lies in `[low, high]`.
    #[must_use]
    pub fn has_key_in_range(&self, low: &[u8], high: &[u8]) -> bool {
        self.nodes
            .range::<[u8], _>((
                std::ops::Bound::Included(low),
                std::ops::Bound::Included(high),
            ))
            .next()
            .is_some()
    }

    /// Returns a snapshot of all node keys, in order.
    #[must_use]
    pub fn node_keys(&self) -> Vec<Vec<u8>> {
        self.nodes.keys().cloned().collect()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the index has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::op::OpKind;
    use crate::types::{Lsn, TransactionId};

    fn op(key: &[u8], lsn: u64) -> TransactionOperation {
        TransactionOperation {
            txn: TransactionId::new(1),
            kind: OpKind::Insert,
            flushed: false,
            orig_flags: 0,
            lsn: Lsn::new(lsn),
            referenced_dupe: 0,
            record: Some(b"r".to_vec()),
            key: key.to_vec(),
            cursors: Vec::new(),
        }
    }

    #[test]
    fn ensure_node_reports_creation() {
        let mut index = TransactionIndex::new();
        assert!(index.ensure_node(b"k"));
        assert!(!index.ensure_node(b"k"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn append_orders_newest_first() {
        let mut index = TransactionIndex::new();
        index.ensure_node(b"k");
        let a = index.append_op(op(b"k", 1));
        let b = index.append_op(op(b"k", 2));
        let node = index.node(b"k").unwrap();
        assert_eq!(node.newest_op(), Some(b));
        let order: Vec<OpId> = node.ops_newest_first().collect();
        assert_eq!(order, vec![b, a]);
    }

    #[test]
    fn remove_empty_node_only() {
        let mut index = TransactionIndex::new();
        index.ensure_node(b"k");
        index.append_op(op(b"k", 1));
        index.remove_node_if_empty(b"k");
        assert!(index.node(b"k").is_some());

        index.ensure_node(b"j");
        index.remove_node_if_empty(b"j");
        assert!(index.node(b"j").is_none());
    }

    #[test]
    fn remove_last_op_drops_node() {
        let mut index = TransactionIndex::new();
        index.ensure_node(b"k");
        let id = index.append_op(op(b"k", 1));
        index.remove_op(id).unwrap();
        assert!(index.node(b"k").is_none());
        assert!(index.op(id).is_none());
    }

    #[test]
    fn sibling_navigation() {
        let mut index = TransactionIndex::new();
        for k in [b"b", b"d", b"f"] {
            index.ensure_node(k);
        }
        assert_eq!(index.first_key().unwrap(), b"b");
        assert_eq!(index.last_key().unwrap(), b"f");
        assert_eq!(index.next_key(b"b").unwrap(), b"d");
        assert_eq!(index.next_key(b"c").unwrap(), b"d");
        assert_eq!(index.prev_key(b"d").unwrap(), b"b");
        assert!(index.next_key(b"f").is_none());
        assert!(index.prev_key(b"b").is_none());
    }

    #[test]
    fn range_queries() {
        let mut index = TransactionIndex::new();
        index.ensure_node(b"d");
        assert!(index.has_key_in_range(b"a", b"z"));
        assert!(index.has_key_in_range(b"d", b"d"));
        assert!(!index.has_key_in_range(b"e", b"z"));
    }
}

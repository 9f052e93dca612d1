//! Saved-ID ↔ live-node map used while writing or reading a session.
//!
//! One table lives for one save or one load; it is never shared.

use crate::pipeline::NodeId;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct IdTable {
    to_node: HashMap<u32, NodeId>,
    to_saved: HashMap<NodeId, u32>,
    next_id: u32,
}

impl IdTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Saved ID for `node`, assigning the next free one if needed.
    pub fn emplace(&mut self, node: NodeId) -> u32 {
        if let Some(&id) = self.to_saved.get(&node) {
            return id;
        }
        while self.to_node.contains_key(&self.next_id) {
            self.next_id += 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.to_node.insert(id, node);
        self.to_saved.insert(node, id);
        id
    }

    /// Bind a saved ID read from a document. Returns false if either side is
    /// already bound to something else.
    pub fn insert(&mut self, saved: u32, node: NodeId) -> bool {
        match (self.to_node.get(&saved), self.to_saved.get(&node)) {
            (None, None) => {
                self.to_node.insert(saved, node);
                self.to_saved.insert(node, saved);
                true
            }
            (Some(&n), Some(&s)) => n == node && s == saved,
            _ => false,
        }
    }

    pub fn node(&self, saved: u32) -> Option<NodeId> {
        self.to_node.get(&saved).copied()
    }

    pub fn saved_id(&self, node: NodeId) -> Option<u32> {
        self.to_saved.get(&node).copied()
    }

    pub fn len(&self) -> usize {
        self.to_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_node.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emplace_is_stable() {
        let mut ids = IdTable::new();
        let a = ids.emplace(NodeId(5));
        let b = ids.emplace(NodeId(9));
        assert_ne!(a, b);
        assert_eq!(ids.emplace(NodeId(5)), a);
        assert_eq!(ids.node(b), Some(NodeId(9)));
        assert_eq!(ids.saved_id(NodeId(5)), Some(a));
    }

    #[test]
    fn test_insert_rejects_conflicts() {
        let mut ids = IdTable::new();
        assert!(ids.insert(1, NodeId(0)));
        assert!(ids.insert(1, NodeId(0)));
        assert!(!ids.insert(1, NodeId(3)));
        assert!(!ids.insert(2, NodeId(0)));
        // Fresh IDs skip ones taken by loaded documents
        assert_eq!(ids.emplace(NodeId(7)), 2);
    }
}

//! The in-process node registry.

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::domain::node::{normalize_url, SharedNode};

/// Membership of the backend pool.
///
/// Uses `ArcSwap` so the selection hot path reads a snapshot without
/// taking locks; membership changes go through read-copy-update. Node
/// state itself is atomic and shared across snapshots.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: ArcSwap<Vec<SharedNode>>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::with_nodes(Vec::new())
    }

    /// Creates a registry seeded with `nodes`.
    pub fn with_nodes(nodes: Vec<SharedNode>) -> Self {
        Self {
            nodes: ArcSwap::from_pointee(nodes),
        }
    }

    /// Retrieves a snapshot of all current nodes.
    pub fn snapshot(&self) -> Arc<Vec<SharedNode>> {
        self.nodes.load_full()
    }

    /// Looks up a node by URL.
    pub fn get(&self, url: &str) -> Option<SharedNode> {
        let url = normalize_url(url.to_string());
        self.nodes
            .load()
            .iter()
            .find(|node| node.url() == url)
            .cloned()
    }

    /// Whether a node with this URL is registered.
    pub fn contains(&self, url: &str) -> bool {
        self.get(url).is_some()
    }

    /// Adds a node unless its URL is already registered.
    ///
    /// Returns `true` when the node was inserted.
    pub fn insert(&self, node: SharedNode) -> bool {
        let mut inserted = false;
        self.nodes.rcu(|current| {
            let mut next = Vec::clone(current);
            if next.iter().any(|existing| existing.url() == node.url()) {
                inserted = false;
            } else {
                inserted = true;
                next.push(Arc::clone(&node));
            }
            next
        });
        inserted
    }

    /// Removes and returns the node with this URL, if registered.
    pub fn remove(&self, url: &str) -> Option<SharedNode> {
        let url = normalize_url(url.to_string());
        let mut removed = None;
        self.nodes.rcu(|current| {
            let mut next = Vec::clone(current);
            if let Some(index) = next.iter().position(|node| node.url() == url) {
                removed = Some(next.remove(index));
            } else {
                removed = None;
            }
            next
        });
        removed
    }

    /// Atomically replaces the entire membership (startup reload).
    pub fn replace_all(&self, nodes: Vec<SharedNode>) {
        self.nodes.store(Arc::new(nodes));
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    /// Whether the registry holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.load().is_empty()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

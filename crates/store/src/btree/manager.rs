//! Node allocation, loading and commit.
//!
//! The manager owns the tree storage. Writers obtain fresh or copied nodes from it while an
//! operation runs and hand it the new root; [`NodeManager::commit_dirty_nodes`] later writes
//! every unwritten node reachable from that root, children before parents, so each parent
//! can record its children's final page numbers.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use tracing::trace;

use super::{
    cache::{CacheStats, NodeCache},
    codec::{self, PageLayout},
    node::{InternalNode, Node, NodeBody, NodeHeader, NodeRef},
};
use crate::{
    buffer::PageRead,
    error::{PageNumber, Result},
    storage::StorageBackend,
};

/// Result of writing a dirty root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Page the root was written to.
    pub root_page: PageNumber,
    /// Byte offset of the root page.
    pub root_offset: u64,
    /// Number of pages appended.
    pub nodes_written: usize,
    /// Version recorded in the root header.
    pub version: u64,
    /// Timestamp recorded in the root header.
    pub timestamp: u64,
}

/// Allocates, loads and persists nodes of one tree storage.
pub struct NodeManager<S: StorageBackend> {
    storage: S,
    layout: PageLayout,
    cache: NodeCache,
    dirty_root: Mutex<Option<Arc<Node>>>,
    dirty_nodes: AtomicUsize,
}

impl<S: StorageBackend> NodeManager<S> {
    /// Creates a manager over `storage` with a decoded-node cache of `cache_capacity` nodes.
    pub fn new(storage: S, cache_capacity: usize) -> Self {
        let layout = PageLayout::from_header(&storage.static_header());
        Self {
            storage,
            layout,
            cache: NodeCache::new(cache_capacity),
            dirty_root: Mutex::new(None),
            dirty_nodes: AtomicUsize::new(0),
        }
    }

    /// The tree storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Page layout of the tree storage.
    pub fn layout(&self) -> &PageLayout {
        &self.layout
    }

    /// Decoded-node cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Nodes created since the last commit.
    pub fn dirty_count(&self) -> usize {
        self.dirty_nodes.load(Ordering::Relaxed)
    }

    fn track(&self, node: Node) -> Node {
        self.dirty_nodes.fetch_add(1, Ordering::Relaxed);
        node
    }

    /// New dirty leaf with no keys.
    pub fn create_empty_leaf(&self, header: NodeHeader) -> Node {
        self.track(Node::empty_leaf(header))
    }

    /// New dirty internal node with no keys or children.
    pub fn create_empty_internal(&self, header: NodeHeader) -> Node {
        self.track(Node::empty_internal(header))
    }

    /// Dirty copy of `node` carrying `header`.
    pub fn copy_node(&self, node: &Node, header: NodeHeader) -> Node {
        self.track(node.copy(header))
    }

    /// Splits `node` at its midpoint, returning the separator and the new right sibling.
    pub fn split_node(&self, node: &mut Node) -> (u64, Node) {
        let (separator, right) = node.split();
        (separator, self.track(right))
    }

    /// Records the root whose unwritten nodes the next commit persists.
    pub fn add_dirty_root(&self, root: Arc<Node>) {
        *self.dirty_root.lock() = Some(root);
    }

    /// Returns true if a root is waiting to be committed.
    pub fn has_dirty_root(&self) -> bool {
        self.dirty_root.lock().is_some()
    }

    /// Loads and verifies the node stored on `page`, consulting the cache first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageChecksumMismatch`](crate::Error::PageChecksumMismatch) if the page is
    /// damaged, or an I/O or range error if it cannot be mapped.
    pub fn load_node(&self, page: PageNumber) -> Result<Arc<Node>> {
        if let Some(node) = self.cache.get(page) {
            return Ok(node);
        }
        trace!(page, "Node cache miss");
        let mapped = self.storage.map_page(page)?;
        let node = Arc::new(codec::decode(&mapped, page, &self.layout)?);
        self.cache.insert(page, Arc::clone(&node));
        Ok(node)
    }

    /// Resolves a child reference to its node.
    pub fn resolve(&self, node: &NodeRef) -> Result<Arc<Node>> {
        match node {
            NodeRef::Memory(node) => Ok(Arc::clone(node)),
            NodeRef::Stored(page) => self.load_node(*page),
        }
    }

    /// Writes every unwritten node reachable from the dirty root, children first, and
    /// flushes the storage. Returns `None` if no root is pending.
    ///
    /// On failure the dirty root stays registered, so the commit can be retried. Pages
    /// appended before the failure are unreachable and are ignored on reopen.
    ///
    /// # Errors
    ///
    /// Returns any error raised while encoding, appending or flushing.
    pub fn commit_dirty_nodes(&self, sync: bool) -> Result<Option<CommitOutcome>> {
        let mut dirty_root = self.dirty_root.lock();
        let Some(root) = dirty_root.as_ref() else {
            return Ok(None);
        };
        let mut nodes_written = 0;
        let root_page = self.write_post_order(root, &mut nodes_written)?;
        self.storage.flush(sync)?;
        let outcome = CommitOutcome {
            root_page,
            root_offset: root_page * self.layout.page_size as u64,
            nodes_written,
            version: root.header.version,
            timestamp: root.header.timestamp,
        };
        *dirty_root = None;
        self.dirty_nodes.store(0, Ordering::Relaxed);
        Ok(Some(outcome))
    }

    fn write_post_order(&self, node: &Arc<Node>, written: &mut usize) -> Result<PageNumber> {
        if let Some(page) = node.page() {
            return Ok(page);
        }
        let mut children = Vec::new();
        if let NodeBody::Internal(internal) = &node.body {
            children.reserve(internal.children.len());
            for child in &internal.children {
                let page = match child {
                    NodeRef::Memory(child) => self.write_post_order(child, written)?,
                    NodeRef::Stored(page) => *page,
                };
                children.push(page);
            }
        }
        let page = codec::encode(node, &children, &self.layout)?;
        let offset = self.storage.append(page.as_bytes())?;
        let page_number = offset / self.layout.page_size as u64;
        node.set_page(page_number);
        // Cache the form a fresh load would produce, so the cache never pins in-memory subtrees.
        let body = match &node.body {
            NodeBody::Leaf(leaf) => NodeBody::Leaf(leaf.clone()),
            NodeBody::Internal(internal) => NodeBody::Internal(InternalNode {
                keys: internal.keys.clone(),
                children: children.into_iter().map(NodeRef::Stored).collect(),
            }),
        };
        self.cache.insert(page_number, Arc::new(Node::stored(node.header, body, page_number)));
        *written += 1;
        Ok(page_number)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        config::StoreConfig,
        storage::{InMemoryStorage, StaticHeader},
    };

    fn manager() -> NodeManager<InMemoryStorage> {
        let config = StoreConfig::builder().page_size(512).segment_size(4096).build().unwrap();
        NodeManager::new(InMemoryStorage::new(StaticHeader::from_config(&config)), 16)
    }

    fn leaf(manager: &NodeManager<InMemoryStorage>, keys: &[u64]) -> Arc<Node> {
        let mut node = manager.create_empty_leaf(NodeHeader::new(0, 1));
        for &key in keys {
            node.as_leaf_mut().unwrap().insert(key, key * 2);
        }
        Arc::new(node)
    }

    #[test]
    fn test_commit_writes_children_before_parent() {
        let manager = manager();
        let left = leaf(&manager, &[1, 2]);
        let right = leaf(&manager, &[5, 6]);
        let mut root = manager.create_empty_internal(NodeHeader::new(0, 1));
        root.header.is_root = true;
        let internal = root.as_internal_mut().unwrap();
        internal.keys.push(5);
        internal.children.push(NodeRef::Memory(Arc::clone(&left)));
        internal.children.push(NodeRef::Memory(Arc::clone(&right)));
        let root = Arc::new(root);
        assert_eq!(manager.dirty_count(), 3);

        manager.add_dirty_root(Arc::clone(&root));
        let outcome = manager.commit_dirty_nodes(false).unwrap().unwrap();
        assert_eq!(outcome.nodes_written, 3);
        assert_eq!(left.page(), Some(0));
        assert_eq!(right.page(), Some(1));
        assert_eq!(outcome.root_page, 2);
        assert_eq!(outcome.root_offset, 1024);
        assert_eq!(outcome.version, 0);
        assert_eq!(manager.dirty_count(), 0);
        assert!(!manager.has_dirty_root());
        assert!(manager.commit_dirty_nodes(false).unwrap().is_none());
    }

    #[test]
    fn test_load_after_commit() {
        let manager = manager();
        let root = leaf(&manager, &[3, 1, 2]);
        manager.add_dirty_root(Arc::clone(&root));
        let page = manager.commit_dirty_nodes(false).unwrap().unwrap().root_page;

        let loaded = manager.load_node(page).unwrap();
        assert_eq!(loaded.as_leaf(), root.as_leaf());
        assert_eq!(loaded.page(), Some(page));
        assert_eq!(manager.cache_stats().misses, 0);

        let fresh = NodeManager::new(
            InMemoryStorage::new(manager.storage().static_header()),
            0,
        );
        assert!(fresh.load_node(page).is_err());
    }

    #[test]
    fn test_stored_children_are_not_rewritten() {
        let manager = manager();
        let first = leaf(&manager, &[1]);
        manager.add_dirty_root(Arc::clone(&first));
        manager.commit_dirty_nodes(false).unwrap();

        let second = leaf(&manager, &[9]);
        let mut root = manager.create_empty_internal(NodeHeader::new(1, 1));
        let internal = root.as_internal_mut().unwrap();
        internal.keys.push(9);
        internal.children.push(NodeRef::Stored(0));
        internal.children.push(NodeRef::Memory(second));
        manager.add_dirty_root(Arc::new(root));
        let outcome = manager.commit_dirty_nodes(true).unwrap().unwrap();
        assert_eq!(outcome.nodes_written, 2);
        assert_eq!(manager.storage().sync_count(), 1);

        let root = manager.load_node(outcome.root_page).unwrap();
        let children: Vec<_> =
            root.as_internal().unwrap().children.iter().filter_map(NodeRef::page).collect();
        assert_eq!(children, vec![0, 1]);
    }

    #[test]
    fn test_split_node_tracks_sibling() {
        let manager = manager();
        let mut node = manager.create_empty_leaf(NodeHeader::default());
        for key in 0..6 {
            node.as_leaf_mut().unwrap().insert(key, key);
        }
        let (separator, right) = manager.split_node(&mut node);
        assert_eq!(separator, 3);
        assert_eq!(right.key_count(), 3);
        assert_eq!(manager.dirty_count(), 2);
    }
}

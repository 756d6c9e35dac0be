//! In-memory B+ tree nodes.
//!
//! A node is a shared [`NodeHeader`] plus a kind-specific [`NodeBody`]. Nodes are never
//! mutated once they are reachable from an installed root: every logical change copies the
//! affected nodes (see [`Node::copy`]) and links the copies into a new root.
//!
//! Keys and values are `u64`. A leaf value is either an inline number or an offset into
//! the value log, depending on the caller.

use std::sync::{Arc, OnceLock};

use crate::error::PageNumber;

/// A search result for finding a key in a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Key was found at this index.
    Found(usize),
    /// Key was not found; this is where it would be inserted.
    NotFound(usize),
}

impl SearchResult {
    /// Get the index, whether found or not.
    pub fn index(&self) -> usize {
        match self {
            SearchResult::Found(i) | SearchResult::NotFound(i) => *i,
        }
    }

    /// Returns true if the key was found.
    pub fn is_found(&self) -> bool {
        matches!(self, SearchResult::Found(_))
    }
}

fn search(keys: &[u64], key: u64) -> SearchResult {
    match keys.binary_search(&key) {
        Ok(i) => SearchResult::Found(i),
        Err(i) => SearchResult::NotFound(i),
    }
}

/// Header fields common to leaves and internal nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeHeader {
    /// Set on the root of a committed version.
    pub is_root: bool,
    /// Page of the root this root superseded.
    pub previous_root: Option<PageNumber>,
    /// Version of the write that produced the node.
    pub version: u64,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl NodeHeader {
    /// Header of a non-root node created by the write at `version`.
    pub fn new(version: u64, timestamp: u64) -> Self {
        Self { is_root: false, previous_root: None, version, timestamp }
    }
}

/// Kind of a pending leaf log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOp {
    /// Insert or overwrite.
    Put = 1,
    /// Delete.
    Remove = 2,
}

impl LogOp {
    /// Decodes the on-page tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(LogOp::Put),
            2 => Some(LogOp::Remove),
            _ => None,
        }
    }
}

/// Mutation buffered in a leaf's unsorted log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    /// Target key.
    pub key: u64,
    /// New value (ignored for removals).
    pub value: u64,
    /// Operation.
    pub op: LogOp,
}

/// Sorted key/value arrays plus the optional append log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeafNode {
    /// Ascending, unique keys.
    pub keys: Vec<u64>,
    /// Values, parallel to `keys`.
    pub values: Vec<u64>,
    /// Pending mutations, oldest first, at most one per key.
    pub log: Vec<LogEntry>,
}

impl LeafNode {
    /// Searches the sorted region.
    pub fn search(&self, key: u64) -> SearchResult {
        search(&self.keys, key)
    }

    /// Effective value of `key`, consulting the log before the sorted region.
    pub fn get(&self, key: u64) -> Option<u64> {
        if let Some(entry) = self.log.iter().rev().find(|entry| entry.key == key) {
            return match entry.op {
                LogOp::Put => Some(entry.value),
                LogOp::Remove => None,
            };
        }
        match self.search(key) {
            SearchResult::Found(i) => Some(self.values[i]),
            SearchResult::NotFound(_) => None,
        }
    }

    /// Inserts or overwrites in the sorted region, returning the previous value.
    pub fn insert(&mut self, key: u64, value: u64) -> Option<u64> {
        match self.search(key) {
            SearchResult::Found(i) => Some(std::mem::replace(&mut self.values[i], value)),
            SearchResult::NotFound(i) => {
                self.keys.insert(i, key);
                self.values.insert(i, value);
                None
            },
        }
    }

    /// Deletes from the sorted region, returning the removed value.
    pub fn delete(&mut self, key: u64) -> Option<u64> {
        match self.search(key) {
            SearchResult::Found(i) => {
                self.keys.remove(i);
                Some(self.values.remove(i))
            },
            SearchResult::NotFound(_) => None,
        }
    }

    /// Appends a log entry, replacing any earlier entry for the same key.
    pub fn append_log(&mut self, entry: LogEntry) {
        self.log.retain(|existing| existing.key != entry.key);
        self.log.push(entry);
    }

    /// Applies every log entry to the sorted region and clears the log.
    pub fn merge_log(&mut self) {
        for entry in std::mem::take(&mut self.log) {
            match entry.op {
                LogOp::Put => {
                    self.insert(entry.key, entry.value);
                },
                LogOp::Remove => {
                    self.delete(entry.key);
                },
            }
        }
    }

    /// Moves keys `[at, len)` into a new right sibling. The log must be empty.
    pub fn split_off(&mut self, at: usize) -> LeafNode {
        debug_assert!(self.log.is_empty(), "split of a leaf with pending log entries");
        LeafNode { keys: self.keys.split_off(at), values: self.values.split_off(at), log: Vec::new() }
    }

    /// Effective entries in key order.
    pub fn entries(&self) -> Vec<(u64, u64)> {
        if self.log.is_empty() {
            return self.keys.iter().copied().zip(self.values.iter().copied()).collect();
        }
        let mut merged = self.clone();
        merged.merge_log();
        merged.keys.into_iter().zip(merged.values).collect()
    }
}

/// Reference from an internal node to a child.
#[derive(Debug, Clone)]
pub enum NodeRef {
    /// Uncommitted child, reachable only through this pointer.
    Memory(Arc<Node>),
    /// Committed child, loaded on demand.
    Stored(PageNumber),
}

impl NodeRef {
    /// Page number if the child has been written.
    pub fn page(&self) -> Option<PageNumber> {
        match self {
            NodeRef::Memory(node) => node.page(),
            NodeRef::Stored(page) => Some(*page),
        }
    }
}

/// Separator keys and child references.
#[derive(Debug, Clone, Default)]
pub struct InternalNode {
    /// Ascending separators; `keys.len() == children.len() - 1`.
    pub keys: Vec<u64>,
    /// Children; child `i` covers keys in `[keys[i-1], keys[i])`.
    pub children: Vec<NodeRef>,
}

impl InternalNode {
    /// Index of the child whose range contains `key`.
    pub fn child_index(&self, key: u64) -> usize {
        match search(&self.keys, key) {
            SearchResult::Found(i) => i + 1,
            SearchResult::NotFound(i) => i,
        }
    }

    /// Splits at key index `at`: `keys[at]` moves up, keys above it move into the returned
    /// sibling together with their children.
    pub fn split_off(&mut self, at: usize) -> (u64, InternalNode) {
        let mut right_keys = self.keys.split_off(at);
        let promoted = right_keys.remove(0);
        let right_children = self.children.split_off(at + 1);
        (promoted, InternalNode { keys: right_keys, children: right_children })
    }

    /// Replaces children `[start, start + count)` and the separators between them with
    /// `nodes`, separated by `separators`.
    pub fn splice(&mut self, start: usize, count: usize, nodes: Vec<NodeRef>, separators: Vec<u64>) {
        debug_assert!(count >= 1 && start + count <= self.children.len());
        debug_assert_eq!(nodes.len(), separators.len() + 1);
        self.keys.splice(start..start + count - 1, separators);
        self.children.splice(start..start + count, nodes);
    }
}

/// Kind-specific node payload.
#[derive(Debug, Clone)]
pub enum NodeBody {
    /// Leaf node.
    Leaf(LeafNode),
    /// Internal node.
    Internal(InternalNode),
}

/// A tree node.
#[derive(Debug)]
pub struct Node {
    /// Common header.
    pub header: NodeHeader,
    /// Kind-specific payload.
    pub body: NodeBody,
    page: OnceLock<PageNumber>,
}

impl Node {
    /// Creates an unwritten node.
    pub fn new(header: NodeHeader, body: NodeBody) -> Self {
        Self { header, body, page: OnceLock::new() }
    }

    /// Creates a node decoded from `page`.
    pub(crate) fn stored(header: NodeHeader, body: NodeBody, page: PageNumber) -> Self {
        Self { header, body, page: OnceLock::from(page) }
    }

    /// Empty leaf.
    pub fn empty_leaf(header: NodeHeader) -> Self {
        Self::new(header, NodeBody::Leaf(LeafNode::default()))
    }

    /// Empty internal node.
    pub fn empty_internal(header: NodeHeader) -> Self {
        Self::new(header, NodeBody::Internal(InternalNode::default()))
    }

    /// Unwritten copy carrying a fresh header.
    pub fn copy(&self, header: NodeHeader) -> Self {
        Self::new(header, self.body.clone())
    }

    /// Page the node was written to, if any.
    pub fn page(&self) -> Option<PageNumber> {
        self.page.get().copied()
    }

    /// Records the page the node was written to. Ignored if already set.
    pub(crate) fn set_page(&self, page: PageNumber) {
        let _ = self.page.set(page);
    }

    /// Returns true until the node has been written.
    pub fn is_dirty(&self) -> bool {
        self.page.get().is_none()
    }

    /// Returns true for leaves.
    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf(_))
    }

    /// Number of keys in the sorted region (leaf) or separators (internal).
    pub fn key_count(&self) -> usize {
        match &self.body {
            NodeBody::Leaf(leaf) => leaf.keys.len(),
            NodeBody::Internal(internal) => internal.keys.len(),
        }
    }

    /// Leaf payload.
    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match &self.body {
            NodeBody::Leaf(leaf) => Some(leaf),
            NodeBody::Internal(_) => None,
        }
    }

    /// Mutable leaf payload.
    pub fn as_leaf_mut(&mut self) -> Option<&mut LeafNode> {
        match &mut self.body {
            NodeBody::Leaf(leaf) => Some(leaf),
            NodeBody::Internal(_) => None,
        }
    }

    /// Internal payload.
    pub fn as_internal(&self) -> Option<&InternalNode> {
        match &self.body {
            NodeBody::Internal(internal) => Some(internal),
            NodeBody::Leaf(_) => None,
        }
    }

    /// Mutable internal payload.
    pub fn as_internal_mut(&mut self) -> Option<&mut InternalNode> {
        match &mut self.body {
            NodeBody::Internal(internal) => Some(internal),
            NodeBody::Leaf(_) => None,
        }
    }

    /// Splits at the key midpoint (`key_count >> 1`), returning the separator and the new
    /// right sibling. The sibling shares this node's header.
    pub fn split(&mut self) -> (u64, Node) {
        let at = self.key_count() >> 1;
        let header = NodeHeader::new(self.header.version, self.header.timestamp);
        match &mut self.body {
            NodeBody::Leaf(leaf) => {
                let right = leaf.split_off(at);
                let separator = right.keys[0];
                (separator, Node::new(header, NodeBody::Leaf(right)))
            },
            NodeBody::Internal(internal) => {
                let (separator, right) = internal.split_off(at);
                (separator, Node::new(header, NodeBody::Internal(right)))
            },
        }
    }
}

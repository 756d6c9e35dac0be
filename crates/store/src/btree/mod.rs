//! Versioned copy-on-write B+ tree.
//!
//! Every write copies the root-to-leaf path it touches, links the copies into a new root,
//! and installs that root as a new version with a single compare-and-swap. Readers load the
//! current root once and then work on immutable nodes, so they never block and never see a
//! half-applied write.
//!
//! ## Structure
//!
//! - `node.rs`: in-memory leaf and internal nodes
//! - `codec.rs`: node page layout
//! - `manager.rs`: node allocation, loading and commit
//! - `cache.rs`: decoded-node cache
//! - `root.rs`: version chain
//! - `cursor.rs`: iteration and key ranges
//!
//! ## Write path
//!
//! A write descends from the current root recording a [`CursorPosition`] per internal node,
//! copies the leaf, applies the change and walks back up. At each level the changed child
//! is split while it holds more than `max_children_per_node` keys, or rebalanced with a
//! sibling (borrow when the sibling can spare a key, merge otherwise) when it fell below
//! half of that. The parent is copied, the results are spliced in and the walk continues.
//! Splits of the root grow a new root; an internal root left with a single child is
//! replaced by that child.
//!
//! With log-buffered leaves, a write to a leaf appends to the leaf's log instead of
//! rewriting its sorted arrays. A full log is merged into the sorted region before the
//! write is applied there.

/// Decoded-node cache.
pub mod cache;
/// Node page encoding.
pub mod codec;
/// Tree positions and iteration.
pub mod cursor;
/// Node allocation and commit.
pub mod manager;
/// In-memory node model.
pub mod node;
/// Version chain.
pub mod root;

use std::{
    ops::RangeBounds,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use cache::CacheStats;
pub use cursor::{BTreeIterator, CursorPosition, KeyRange};
use manager::{CommitOutcome, NodeManager};
use node::{InternalNode, LeafNode, LogEntry, LogOp, Node, NodeBody, NodeHeader, NodeRef};
pub use root::RootReference;

use crate::{
    config::{StoreConfig, VersionRetention},
    error::{Error, PageNumber, Result},
    root_index::{RootIndex, RootIndexRecord, root_index_segment_size},
    storage::{InMemoryStorage, StaticHeader, StorageBackend},
};

#[derive(Debug, Clone, Copy)]
struct TreeSettings {
    max_keys: usize,
    min_keys: usize,
    log_capacity: usize,
    retention: VersionRetention,
    sync_on_commit: bool,
}

#[derive(Debug, Clone, Copy)]
enum Mutation {
    Put(u64),
    Remove,
}

/// Nodes replacing one child of a parent, with the separators between them.
#[derive(Default)]
struct Level {
    nodes: Vec<Node>,
    separators: Vec<u64>,
}

impl Level {
    fn into_refs(self) -> (Vec<NodeRef>, Vec<u64>) {
        let nodes = self.nodes.into_iter().map(|node| NodeRef::Memory(Arc::new(node))).collect();
        (nodes, self.separators)
    }
}

/// A versioned B+ tree mapping `u64` keys to `u64` values.
///
/// Writes are single-writer: callers must serialize `put`, `remove` and `commit`. A write
/// that races another is rejected with [`Error::ConcurrentModification`] instead of being
/// silently lost. Reads may run concurrently with everything.
pub struct BTree<S: StorageBackend> {
    manager: NodeManager<S>,
    roots: RootIndex<S>,
    current: ArcSwapOption<RootReference>,
    committed: Mutex<Option<u64>>,
    /// Nodes written whose root record is not yet durable.
    unrecorded: Mutex<Option<CommitOutcome>>,
    installs_since_prune: AtomicUsize,
    settings: TreeSettings,
}

impl BTree<InMemoryStorage> {
    /// Creates an empty tree over in-memory storages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is invalid.
    pub fn in_memory(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let header = StaticHeader::from_config(config);
        let roots_header = header.with_segment_size(root_index_segment_size(header.segment_size));
        Self::create(InMemoryStorage::new(header), InMemoryStorage::new(roots_header), config)
    }
}

impl<S: StorageBackend> BTree<S> {
    /// Creates an empty tree over fresh storages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the storages already hold a tree or do not match
    /// the configuration.
    pub fn create(tree_storage: S, root_storage: S, config: &StoreConfig) -> Result<Self> {
        let tree = Self::assemble(tree_storage, root_storage, config)?;
        if !tree.roots.is_empty() {
            return Err(Error::InvalidConfig {
                reason: format!("root index already holds {} committed roots", tree.roots.len()),
            });
        }
        Ok(tree)
    }

    /// Opens the tree stored in `tree_storage`, starting from the newest committed root.
    ///
    /// Only the newest version is in memory after opening; older committed versions stay
    /// readable through [`committed_snapshot`](Self::committed_snapshot).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the storages do not match the configuration.
    /// Returns a corruption error if the newest root fails verification.
    pub fn open(tree_storage: S, root_storage: S, config: &StoreConfig) -> Result<Self> {
        let tree = Self::assemble(tree_storage, root_storage, config)?;
        let Some(record) = tree.roots.latest()? else {
            info!("Opened empty tree");
            return Ok(tree);
        };
        let page = record.page(tree.manager.layout().page_size);
        let root = tree.manager.load_node(page)?;
        if !root.header.is_root || root.header.version != record.version {
            return Err(Error::Corrupted {
                reason: format!(
                    "root index points at page {page}, which is not the root of version {}",
                    record.version
                ),
            });
        }
        tree.current.store(Some(Arc::new(RootReference::new(
            NodeRef::Stored(page),
            record.version,
            record.timestamp,
            None,
        ))));
        *tree.committed.lock() = Some(record.version);
        info!(version = record.version, root_page = page, commits = tree.roots.len(), "Opened tree");
        Ok(tree)
    }

    fn assemble(tree_storage: S, root_storage: S, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let header = tree_storage.static_header();
        if header.page_size as usize != config.page_size
            || header.page_log_size as usize != config.page_log_size()
        {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "tree storage has {}-byte pages with a {}-byte log, config expects {} and {}",
                    header.page_size,
                    header.page_log_size,
                    config.page_size,
                    config.page_log_size()
                ),
            });
        }
        let manager = NodeManager::new(tree_storage, config.cache_capacity);
        let settings = TreeSettings {
            max_keys: config.max_children_per_node,
            min_keys: config.min_children_per_node(),
            log_capacity: manager.layout().log_capacity(),
            retention: config.version_retention,
            sync_on_commit: config.sync_on_commit,
        };
        Ok(Self {
            manager,
            roots: RootIndex::new(root_storage)?,
            current: ArcSwapOption::empty(),
            committed: Mutex::new(None),
            unrecorded: Mutex::new(None),
            installs_since_prune: AtomicUsize::new(0),
            settings,
        })
    }

    /// Current version, or `None` before the first write.
    pub fn version(&self) -> Option<u64> {
        self.current.load_full().map(|reference| reference.version())
    }

    /// Newest committed version.
    pub fn committed_version(&self) -> Option<u64> {
        *self.committed.lock()
    }

    /// Current root reference.
    pub fn current_root(&self) -> Option<Arc<RootReference>> {
        self.current.load_full()
    }

    /// Value of `key` at `version`, or at the current version when `version` is `None`.
    ///
    /// Versions are resolved by walking the in-memory version chain back from the current
    /// one: a version that is newer than the current one, or older than the oldest retained
    /// one, reads as absent.
    pub fn get(&self, key: u64, version: Option<u64>) -> Result<Option<u64>> {
        let Some(current) = self.current.load_full() else {
            return Ok(None);
        };
        let reference = match version {
            None => current,
            Some(version) => match current.find(version) {
                Some(reference) => reference,
                None => return Ok(None),
            },
        };
        self.lookup(reference.root(), key)
    }

    fn lookup(&self, root: &NodeRef, key: u64) -> Result<Option<u64>> {
        let mut node = self.manager.resolve(root)?;
        loop {
            let child = match &node.body {
                NodeBody::Leaf(leaf) => return Ok(leaf.get(key)),
                NodeBody::Internal(internal) => {
                    self.manager.resolve(&internal.children[internal.child_index(key)])?
                },
            };
            node = child;
        }
    }

    /// Snapshot of the current version.
    pub fn snapshot(&self) -> Option<Snapshot<'_, S>> {
        self.current.load_full().map(|reference| Snapshot { tree: self, reference })
    }

    /// Snapshot of a retained version.
    pub fn snapshot_at(&self, version: u64) -> Option<Snapshot<'_, S>> {
        let reference = self.current.load_full()?.find(version)?;
        Some(Snapshot { tree: self, reference })
    }

    /// Snapshot of a committed version, located through the root index. Works for versions
    /// that are no longer in the in-memory chain, including those committed before a reopen.
    pub fn committed_snapshot(&self, version: u64) -> Result<Option<Snapshot<'_, S>>> {
        let Some(record) = self.roots.find(version)? else {
            return Ok(None);
        };
        let page = record.page(self.manager.layout().page_size);
        let reference =
            Arc::new(RootReference::new(NodeRef::Stored(page), record.version, record.timestamp, None));
        Ok(Some(Snapshot { tree: self, reference }))
    }

    /// Iterates the current version in key order.
    pub fn iter(&self) -> BTreeIterator<'_, S> {
        self.range(..)
    }

    /// Iterates the keys of the current version inside `bounds`.
    pub fn range(&self, bounds: impl RangeBounds<u64>) -> BTreeIterator<'_, S> {
        let root = self.current.load_full().map(|reference| reference.root().clone());
        BTreeIterator::new(&self.manager, root, KeyRange::from_bounds(bounds))
    }

    /// Inserts or overwrites `key`, returning the previous value.
    ///
    /// Installs a new version unless the key already maps to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrentModification`] if another write installed a root first,
    /// or an error from loading a stored node.
    pub fn put(&self, key: u64, value: u64) -> Result<Option<u64>> {
        self.write(key, Mutation::Put(value))
    }

    /// Removes `key`, returning its value. Removing an absent key installs no version.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put).
    pub fn remove(&self, key: u64) -> Result<Option<u64>> {
        self.write(key, Mutation::Remove)
    }

    fn write(&self, key: u64, mutation: Mutation) -> Result<Option<u64>> {
        let observed = self.current.load_full();
        let (old_root, path, leaf) = match &observed {
            Some(reference) => {
                let root = self.manager.resolve(reference.root())?;
                let (path, leaf) = self.descend(&root, key)?;
                (Some(root), path, Some(leaf))
            },
            None => (None, Vec::new(), None),
        };

        let existing = leaf.as_ref().and_then(|leaf| leaf.as_leaf()).and_then(|leaf| leaf.get(key));
        match (mutation, existing) {
            (Mutation::Remove, None) => return Ok(None),
            (Mutation::Put(value), Some(old)) if old == value => return Ok(Some(old)),
            _ => {},
        }

        let version = observed.as_ref().map_or(0, |reference| reference.version() + 1);
        let timestamp = root::now_millis();
        let header = NodeHeader::new(version, timestamp);

        let mut leaf = match &leaf {
            Some(leaf) => self.manager.copy_node(leaf, header),
            None => self.manager.create_empty_leaf(header),
        };
        let Some(data) = leaf.as_leaf_mut() else {
            unreachable!("descent ends at a leaf");
        };
        self.apply(data, key, mutation);

        let mut root = self.rebuild(path, leaf, header)?;
        root.header = NodeHeader { is_root: true, ..header };
        root.header.previous_root = match (&observed, &old_root) {
            (Some(reference), Some(old_root)) => {
                reference.root().page().or(old_root.header.previous_root)
            },
            _ => None,
        };
        self.install(observed, Arc::new(root), version, timestamp)?;
        Ok(existing)
    }

    fn descend(&self, root: &Arc<Node>, key: u64) -> Result<(Vec<CursorPosition>, Arc<Node>)> {
        let mut path = Vec::new();
        let mut node = Arc::clone(root);
        loop {
            let child = match &node.body {
                NodeBody::Leaf(_) => return Ok((path, node)),
                NodeBody::Internal(internal) => {
                    debug_assert!(!internal.children.is_empty(), "internal node without children");
                    let child_index = internal.child_index(key);
                    let child = self.manager.resolve(&internal.children[child_index])?;
                    path.push(CursorPosition { node: Arc::clone(&node), child_index });
                    child
                },
            };
            node = child;
        }
    }

    fn apply(&self, leaf: &mut LeafNode, key: u64, mutation: Mutation) {
        let capacity = self.settings.log_capacity;
        if capacity > 0 {
            let logged = leaf.log.iter().any(|entry| entry.key == key);
            if logged || leaf.log.len() < capacity {
                let entry = match mutation {
                    Mutation::Put(value) => LogEntry { key, value, op: LogOp::Put },
                    Mutation::Remove => LogEntry { key, value: 0, op: LogOp::Remove },
                };
                leaf.append_log(entry);
                return;
            }
            leaf.merge_log();
        }
        match mutation {
            Mutation::Put(value) => {
                leaf.insert(key, value);
            },
            Mutation::Remove => {
                leaf.delete(key);
            },
        }
    }

    /// Walks from the changed leaf back to the root, splitting, rebalancing and copying
    /// each ancestor. Returns the new root.
    fn rebuild(&self, mut path: Vec<CursorPosition>, leaf: Node, header: NodeHeader) -> Result<Node> {
        let mut level = self.fit(leaf);
        while let Some(position) = path.pop() {
            let mut parent = self.manager.copy_node(&position.node, header);
            let Some(internal) = parent.as_internal_mut() else {
                unreachable!("cursor positions hold internal nodes");
            };
            let underfull = level.nodes.len() == 1 && self.is_underfull(&level.nodes[0]);
            if underfull && internal.children.len() > 1 {
                let node = level.nodes.remove(0);
                self.rebalance(internal, position.child_index, node, header)?;
            } else {
                let (nodes, separators) = level.into_refs();
                internal.splice(position.child_index, 1, nodes, separators);
            }
            level = self.fit(parent);
        }

        while level.nodes.len() > 1 {
            let (children, keys) = level.into_refs();
            let mut root = self.manager.create_empty_internal(header);
            root.body = NodeBody::Internal(InternalNode { keys, children });
            level = self.fit(root);
        }
        let Some(mut root) = level.nodes.pop() else {
            unreachable!("a level always holds at least one node");
        };

        while let NodeBody::Internal(internal) = &mut root.body {
            if !internal.keys.is_empty() {
                break;
            }
            let Some(child) = internal.children.pop() else {
                unreachable!("internal root without children");
            };
            root = self.detach(child, header)?;
        }
        Ok(root)
    }

    /// Splits `node` until every piece holds at most `max_children_per_node` keys.
    fn fit(&self, node: Node) -> Level {
        let mut level = Level::default();
        self.split_into(node, &mut level);
        level
    }

    fn split_into(&self, mut node: Node, level: &mut Level) {
        if node.key_count() <= self.settings.max_keys {
            level.nodes.push(node);
            return;
        }
        if let Some(leaf) = node.as_leaf_mut() {
            leaf.merge_log();
        }
        let (separator, right) = self.manager.split_node(&mut node);
        self.split_into(node, level);
        level.separators.push(separator);
        self.split_into(right, level);
    }

    fn is_underfull(&self, node: &Node) -> bool {
        match &node.body {
            NodeBody::Leaf(leaf) if leaf.log.is_empty() => leaf.keys.len() < self.settings.min_keys,
            // Tombstones in the log do not count towards occupancy.
            NodeBody::Leaf(leaf) => leaf.entries().len() < self.settings.min_keys,
            NodeBody::Internal(internal) => internal.keys.len() < self.settings.min_keys,
        }
    }

    /// Borrows from or merges with a sibling of the underfull `node`, which replaces child
    /// `child_index` of `parent`. The left sibling is preferred.
    fn rebalance(
        &self,
        parent: &mut InternalNode,
        child_index: usize,
        mut node: Node,
        header: NodeHeader,
    ) -> Result<()> {
        if let Some(leaf) = node.as_leaf_mut() {
            leaf.merge_log();
        }
        let from_left = child_index > 0;
        let sibling_index = if from_left { child_index - 1 } else { child_index + 1 };
        let sibling = self.manager.resolve(&parent.children[sibling_index])?;
        let mut sibling = self.manager.copy_node(&sibling, header);
        if let Some(leaf) = sibling.as_leaf_mut() {
            leaf.merge_log();
        }
        let lend = sibling.key_count() > self.settings.min_keys;

        let left_index = child_index.min(sibling_index);
        let separator = parent.keys[left_index];
        let (mut left, mut right) = if from_left { (sibling, node) } else { (node, sibling) };

        let mut level = Level::default();
        if lend {
            let separator = borrow(&mut left, &mut right, separator, from_left);
            self.split_into(left, &mut level);
            level.separators.push(separator);
            self.split_into(right, &mut level);
        } else {
            merge(&mut left, right, separator);
            self.split_into(left, &mut level);
        }
        let (nodes, separators) = level.into_refs();
        parent.splice(left_index, 2, nodes, separators);
        Ok(())
    }

    /// Takes ownership of a child about to become the root.
    fn detach(&self, child: NodeRef, header: NodeHeader) -> Result<Node> {
        match child {
            NodeRef::Memory(node) => match Arc::try_unwrap(node) {
                Ok(node) if node.is_dirty() => Ok(node),
                Ok(node) => Ok(self.manager.copy_node(&node, header)),
                Err(node) => Ok(self.manager.copy_node(&node, header)),
            },
            NodeRef::Stored(page) => {
                let node = self.manager.load_node(page)?;
                Ok(self.manager.copy_node(&node, header))
            },
        }
    }

    fn install(
        &self,
        observed: Option<Arc<RootReference>>,
        root: Arc<Node>,
        version: u64,
        timestamp: u64,
    ) -> Result<()> {
        let reference = Arc::new(RootReference::new(
            NodeRef::Memory(Arc::clone(&root)),
            version,
            timestamp,
            observed.clone(),
        ));
        let witnessed = self.current.compare_and_swap(&observed, Some(reference));
        if !same_reference(&witnessed, &observed) {
            warn!(version, "Root changed while installing a write; write rejected");
            return Err(Error::ConcurrentModification { version });
        }
        drop(witnessed);
        self.manager.add_dirty_root(root);

        if let VersionRetention::Last(keep) = self.settings.retention {
            // Pruned in batches: the chain holds between `keep` and `2 * keep` versions.
            if self.installs_since_prune.fetch_add(1, Ordering::Relaxed) + 1 >= keep {
                self.installs_since_prune.store(0, Ordering::Relaxed);
                self.prune_versions(keep);
            }
        }
        Ok(())
    }

    /// Releases every in-memory version older than the newest `keep`, returning how many
    /// were released. Committed versions stay readable through
    /// [`committed_snapshot`](Self::committed_snapshot).
    pub fn prune_versions(&self, keep: usize) -> usize {
        match self.current.load_full() {
            Some(current) => current.truncate(keep.max(1)),
            None => 0,
        }
    }

    /// Number of versions reachable from the current one.
    pub fn retained_versions(&self) -> usize {
        self.current.load_full().map_or(0, |reference| reference.chain_len())
    }

    /// Persists the current version.
    ///
    /// Writes every unwritten node of the current root, flushes the tree storage, then
    /// appends and flushes a root index record. Returns the record, or `None` if nothing
    /// changed since the last commit.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from either storage. Uncommitted nodes, or a root record that
    /// failed to become durable, stay pending, so the commit can be retried.
    pub fn commit(&self) -> Result<Option<RootIndexRecord>> {
        let Some(current) = self.current.load_full() else {
            return Ok(None);
        };
        let sync = self.settings.sync_on_commit;
        let mut unrecorded = self.unrecorded.lock();
        let outcome = match self.manager.commit_dirty_nodes(sync)? {
            Some(outcome) => outcome,
            None => match *unrecorded {
                Some(outcome) => outcome,
                None => return Ok(None),
            },
        };
        *unrecorded = Some(outcome);
        let record = RootIndexRecord {
            version: outcome.version,
            timestamp: outcome.timestamp,
            offset: outcome.root_offset,
        };
        // A failed flush may leave the record appended but not durable.
        if self.roots.latest()?.map(|latest| latest.version) != Some(record.version) {
            self.roots.append(record)?;
        }
        self.roots.flush(sync)?;
        *unrecorded = None;
        *self.committed.lock() = Some(record.version);
        debug!(
            version = record.version,
            nodes_written = outcome.nodes_written,
            root_page = outcome.root_page,
            "Committed tree"
        );

        // Swap the in-memory root for its page so the written nodes can be released.
        if current.version() == record.version {
            let stored = Arc::new(RootReference::new(
                NodeRef::Stored(outcome.root_page),
                current.version(),
                current.timestamp(),
                current.previous(),
            ));
            let witnessed = self.current.compare_and_swap(&current, Some(stored));
            if !same_reference(&witnessed, &Some(current)) {
                debug!(version = record.version, "Root advanced during commit");
            }
        }
        Ok(Some(record))
    }

    /// Every committed root, oldest first.
    pub fn committed_roots(&self) -> Result<Vec<RootIndexRecord>> {
        self.roots.records()
    }

    /// Number of levels, or zero for a tree without a root.
    pub fn depth(&self) -> Result<usize> {
        let Some(current) = self.current.load_full() else {
            return Ok(0);
        };
        let mut depth = 1;
        let mut node = self.manager.resolve(current.root())?;
        loop {
            let child = match &node.body {
                NodeBody::Leaf(_) => return Ok(depth),
                NodeBody::Internal(internal) => self.manager.resolve(&internal.children[0])?,
            };
            depth += 1;
            node = child;
        }
    }

    /// Key counts per level, root first, nodes left to right.
    pub fn shape(&self) -> Result<Vec<Vec<usize>>> {
        let Some(current) = self.current.load_full() else {
            return Ok(Vec::new());
        };
        let mut levels = Vec::new();
        let mut frontier = vec![self.manager.resolve(current.root())?];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            let mut counts = Vec::with_capacity(frontier.len());
            for node in &frontier {
                counts.push(node.key_count());
                if let Some(internal) = node.as_internal() {
                    for child in &internal.children {
                        next.push(self.manager.resolve(child)?);
                    }
                }
            }
            levels.push(counts);
            frontier = next;
        }
        Ok(levels)
    }

    /// Number of nodes in the current version.
    pub fn node_count(&self) -> Result<usize> {
        Ok(self.shape()?.iter().map(Vec::len).sum())
    }

    /// Nodes created since the last commit.
    pub fn dirty_count(&self) -> usize {
        self.manager.dirty_count()
    }

    /// Decoded-node cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.manager.cache_stats()
    }

    /// The tree storage.
    pub fn storage(&self) -> &S {
        self.manager.storage()
    }

    /// The root index.
    pub fn root_index(&self) -> &RootIndex<S> {
        &self.roots
    }
}

fn same_reference(a: &Option<Arc<RootReference>>, b: &Option<Arc<RootReference>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Moves one entry from the fuller sibling into the other and returns the new separator.
fn borrow(left: &mut Node, right: &mut Node, separator: u64, from_left: bool) -> u64 {
    match (&mut left.body, &mut right.body) {
        (NodeBody::Leaf(left), NodeBody::Leaf(right)) => {
            if from_left {
                if let (Some(key), Some(value)) = (left.keys.pop(), left.values.pop()) {
                    right.keys.insert(0, key);
                    right.values.insert(0, value);
                }
            } else if !right.keys.is_empty() {
                left.keys.push(right.keys.remove(0));
                left.values.push(right.values.remove(0));
            }
            right.keys.first().copied().unwrap_or(separator)
        },
        (NodeBody::Internal(left), NodeBody::Internal(right)) => {
            if from_left {
                let (Some(key), Some(child)) = (left.keys.pop(), left.children.pop()) else {
                    return separator;
                };
                right.keys.insert(0, separator);
                right.children.insert(0, child);
                key
            } else {
                if right.keys.is_empty() {
                    return separator;
                }
                left.keys.push(separator);
                left.children.push(right.children.remove(0));
                right.keys.remove(0)
            }
        },
        _ => unreachable!("siblings are on the same level"),
    }
}

/// Appends `right` to `left`, pulling the separator down between internal nodes.
fn merge(left: &mut Node, right: Node, separator: u64) {
    match (&mut left.body, right.body) {
        (NodeBody::Leaf(left), NodeBody::Leaf(right)) => {
            left.keys.extend(right.keys);
            left.values.extend(right.values);
        },
        (NodeBody::Internal(left), NodeBody::Internal(right)) => {
            left.keys.push(separator);
            left.keys.extend(right.keys);
            left.children.extend(right.children);
        },
        _ => unreachable!("siblings are on the same level"),
    }
}

/// A read-only view of one tree version.
pub struct Snapshot<'a, S: StorageBackend> {
    tree: &'a BTree<S>,
    reference: Arc<RootReference>,
}

impl<'a, S: StorageBackend> Snapshot<'a, S> {
    /// Version of the snapshot.
    pub fn version(&self) -> u64 {
        self.reference.version()
    }

    /// Installation time of the version in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.reference.timestamp()
    }

    /// Page of the snapshot's root, if it has been written.
    pub fn root_page(&self) -> Option<PageNumber> {
        self.reference.root().page()
    }

    /// Value of `key` in this version.
    pub fn get(&self, key: u64) -> Result<Option<u64>> {
        self.tree.lookup(self.reference.root(), key)
    }

    /// Iterates this version in key order.
    pub fn iter(&self) -> BTreeIterator<'a, S> {
        self.range(..)
    }

    /// Iterates the keys of this version inside `bounds`.
    pub fn range(&self, bounds: impl RangeBounds<u64>) -> BTreeIterator<'a, S> {
        BTreeIterator::new(
            &self.tree.manager,
            Some(self.reference.root().clone()),
            KeyRange::from_bounds(bounds),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    fn tree(max_children: usize) -> BTree<InMemoryStorage> {
        let config = StoreConfig::builder()
            .page_size(1024)
            .segment_size(64 * 1024)
            .max_children_per_node(max_children)
            .build()
            .unwrap();
        BTree::in_memory(&config).unwrap()
    }

    fn log_tree(max_children: usize) -> BTree<InMemoryStorage> {
        let config = StoreConfig::builder()
            .page_size(1024)
            .segment_size(64 * 1024)
            .max_children_per_node(max_children)
            .log_buffered_leaves(true)
            .log_percentage(10)
            .build()
            .unwrap();
        BTree::in_memory(&config).unwrap()
    }

    fn keys(tree: &BTree<InMemoryStorage>) -> Vec<u64> {
        tree.iter().map(|entry| entry.unwrap().0).collect()
    }

    #[test]
    fn test_empty_tree() {
        let tree = tree(10);
        assert_eq!(tree.get(1, None).unwrap(), None);
        assert_eq!(tree.version(), None);
        assert_eq!(tree.depth().unwrap(), 0);
        assert_eq!(tree.node_count().unwrap(), 0);
        assert_eq!(tree.remove(1).unwrap(), None);
        assert_eq!(tree.version(), None);
        assert!(tree.commit().unwrap().is_none());
        assert_eq!(tree.iter().count(), 0);
    }

    #[test]
    fn test_put_get_overwrite() {
        let tree = tree(10);
        assert_eq!(tree.put(5, 50).unwrap(), None);
        assert_eq!(tree.put(5, 51).unwrap(), Some(50));
        assert_eq!(tree.get(5, None).unwrap(), Some(51));
        assert_eq!(tree.get(6, None).unwrap(), None);
        assert_eq!(tree.version(), Some(1));
    }

    #[test]
    fn test_identical_put_installs_no_version() {
        let tree = tree(10);
        tree.put(1, 10).unwrap();
        let shape = tree.shape().unwrap();
        assert_eq!(tree.put(1, 10).unwrap(), Some(10));
        assert_eq!(tree.version(), Some(0));
        assert_eq!(tree.shape().unwrap(), shape);
    }

    #[test]
    fn test_single_split() {
        let tree = tree(10);
        for key in 0..=10 {
            tree.put(key, key).unwrap();
        }
        assert_eq!(tree.shape().unwrap(), vec![vec![1], vec![5, 6]]);
        let root = tree.manager.resolve(tree.current_root().unwrap().root()).unwrap();
        let internal = root.as_internal().unwrap();
        assert_eq!(internal.keys, vec![5]);
        let left = tree.manager.resolve(&internal.children[0]).unwrap();
        let right = tree.manager.resolve(&internal.children[1]).unwrap();
        assert_eq!(left.as_leaf().unwrap().keys, (0..5).collect::<Vec<_>>());
        assert_eq!(right.as_leaf().unwrap().keys, (5..=10).collect::<Vec<_>>());
        assert_eq!(right.as_leaf().unwrap().keys[0], internal.keys[0]);
    }

    #[test]
    fn test_sequential_hundred_keys_shape() {
        let tree = tree(10);
        for key in 0..100 {
            tree.put(key, key).unwrap();
        }
        assert_eq!(tree.depth().unwrap(), 3);
        let shape = tree.shape().unwrap();
        assert_eq!(shape[0], vec![2]);
        assert_eq!(shape[1], vec![5, 5, 6]);
        assert_eq!(shape[2].len(), 19);
        assert_eq!(tree.node_count().unwrap(), 23);
        for key in 0..100 {
            assert_eq!(tree.get(key, None).unwrap(), Some(key));
        }

        for key in 0..100 {
            assert_eq!(tree.remove(key).unwrap(), Some(key));
        }
        assert_eq!(tree.shape().unwrap(), vec![vec![0]]);
        assert_eq!(tree.node_count().unwrap(), 1);
    }

    #[test]
    fn test_versions_of_one_key() {
        let tree = tree(10);
        for value in [100, 200, 300] {
            tree.put(7, value).unwrap();
        }
        assert_eq!(tree.get(7, Some(0)).unwrap(), Some(100));
        assert_eq!(tree.get(7, Some(1)).unwrap(), Some(200));
        assert_eq!(tree.get(7, Some(2)).unwrap(), Some(300));
        assert_eq!(tree.get(7, Some(3)).unwrap(), None);
    }

    #[test]
    fn test_snapshot_isolation_across_commit() {
        let tree = tree(4);
        for key in 0..20 {
            tree.put(key, key).unwrap();
        }
        tree.commit().unwrap();
        let before = tree.snapshot().unwrap();
        tree.put(3, 333).unwrap();
        tree.remove(4).unwrap();
        tree.commit().unwrap();

        assert_eq!(before.get(3).unwrap(), Some(3));
        assert_eq!(before.get(4).unwrap(), Some(4));
        assert_eq!(tree.get(3, Some(before.version())).unwrap(), Some(3));
        assert_eq!(tree.get(3, None).unwrap(), Some(333));
        assert_eq!(tree.get(4, None).unwrap(), None);
        assert_eq!(before.iter().count(), 20);
    }

    #[test]
    fn test_remove_rebalances() {
        let tree = tree(4);
        for key in 0..200 {
            tree.put(key, key * 3).unwrap();
        }
        for key in (0..200).filter(|key| key % 3 != 0) {
            assert_eq!(tree.remove(key).unwrap(), Some(key * 3));
        }
        let expected: Vec<u64> = (0..200).filter(|key| key % 3 == 0).collect();
        assert_eq!(keys(&tree), expected);

        let shape = tree.shape().unwrap();
        for (depth, level) in shape.iter().enumerate().skip(1) {
            for &count in level {
                assert!((2..=4).contains(&count), "level {depth} has a node with {count} keys");
            }
        }
        for key in expected {
            assert_eq!(tree.get(key, None).unwrap(), Some(key * 3));
        }
    }

    #[test]
    fn test_remove_absent_key_installs_nothing() {
        let tree = tree(10);
        tree.put(1, 1).unwrap();
        assert_eq!(tree.remove(2).unwrap(), None);
        assert_eq!(tree.version(), Some(0));
    }

    #[test]
    fn test_range_iteration() {
        let tree = tree(4);
        for key in (0..100).rev() {
            tree.put(key * 2, key).unwrap();
        }
        let found: Vec<u64> = tree.range(10..20).map(|entry| entry.unwrap().0).collect();
        assert_eq!(found, vec![10, 12, 14, 16, 18]);
        let found: Vec<u64> = tree.range(191..).map(|entry| entry.unwrap().0).collect();
        assert_eq!(found, vec![192, 194, 196, 198]);
        let found: Vec<u64> = tree.range(..=3).map(|entry| entry.unwrap().0).collect();
        assert_eq!(found, vec![0, 2]);
        assert_eq!(tree.range(500..).count(), 0);
    }

    #[test]
    fn test_commit_writes_only_dirty_nodes() {
        let tree = tree(4);
        for key in 0..50 {
            tree.put(key, key).unwrap();
        }
        let first = tree.commit().unwrap().unwrap();
        let nodes = tree.node_count().unwrap() as u64;
        assert_eq!(tree.storage().append_offset(), nodes * 1024);
        assert_eq!(first.version, 49);

        tree.put(0, 1000).unwrap();
        let second = tree.commit().unwrap().unwrap();
        assert_eq!(second.version, 50);
        let written = (tree.storage().append_offset() - nodes * 1024) / 1024;
        assert_eq!(written as usize, tree.depth().unwrap());
        assert!(tree.commit().unwrap().is_none());
        assert_eq!(tree.committed_version(), Some(50));
        assert_eq!(tree.committed_roots().unwrap().len(), 2);
    }

    #[test]
    fn test_previous_root_links_committed_roots() {
        let tree = tree(4);
        tree.put(1, 1).unwrap();
        let first = tree.commit().unwrap().unwrap();
        tree.put(2, 2).unwrap();
        tree.put(3, 3).unwrap();
        let second = tree.commit().unwrap().unwrap();
        let root = tree.manager.load_node(second.page(1024)).unwrap();
        assert!(root.header.is_root);
        assert_eq!(root.header.previous_root, Some(first.page(1024)));
    }

    #[test]
    fn test_committed_snapshot_after_pruning() {
        let tree = tree(4);
        for key in 0..10 {
            tree.put(key, key).unwrap();
            tree.commit().unwrap();
        }
        assert_eq!(tree.prune_versions(2), 8);
        assert_eq!(tree.get(0, Some(3)).unwrap(), None);
        let snapshot = tree.committed_snapshot(3).unwrap().unwrap();
        assert_eq!(snapshot.get(3).unwrap(), Some(3));
        assert_eq!(snapshot.get(4).unwrap(), None);
        assert!(tree.committed_snapshot(42).unwrap().is_none());
    }

    #[test]
    fn test_retention_bounds_history() {
        let config = StoreConfig::builder()
            .page_size(1024)
            .segment_size(64 * 1024)
            .version_retention(VersionRetention::Last(8))
            .build()
            .unwrap();
        let tree = BTree::in_memory(&config).unwrap();
        for key in 0..100 {
            tree.put(key, key).unwrap();
        }
        assert!(tree.retained_versions() >= 8);
        assert!(tree.retained_versions() < 16);
        assert_eq!(tree.get(50, Some(99)).unwrap(), Some(50));
        assert_eq!(tree.get(0, Some(10)).unwrap(), None);
    }

    #[test]
    fn test_log_buffered_leaves() {
        let tree = log_tree(10);
        for key in (0..60).rev() {
            tree.put(key, key + 1).unwrap();
        }
        for key in (0..60).step_by(4) {
            tree.remove(key).unwrap();
        }
        tree.put(1, 99).unwrap();
        for key in 0..60 {
            let expected = match key {
                1 => Some(99),
                key if key % 4 == 0 => None,
                key => Some(key + 1),
            };
            assert_eq!(tree.get(key, None).unwrap(), expected, "key {key}");
        }
        let expected: Vec<u64> = (0..60).filter(|key| key % 4 != 0).collect();
        assert_eq!(keys(&tree), expected);

        tree.commit().unwrap();
        let reopened = tree.committed_snapshot(tree.version().unwrap()).unwrap().unwrap();
        assert_eq!(reopened.get(1).unwrap(), Some(99));
        assert_eq!(reopened.get(4).unwrap(), None);
    }

    #[test]
    fn test_log_buffered_put_touches_log_only() {
        let tree = log_tree(10);
        for key in 0..5 {
            tree.put(key, key).unwrap();
        }
        let root = tree.manager.resolve(tree.current_root().unwrap().root()).unwrap();
        let leaf = root.as_leaf().unwrap();
        assert!(leaf.keys.is_empty());
        assert_eq!(leaf.log.len(), 5);
        assert_eq!(leaf.entries().len(), 5);
    }

    #[test]
    fn test_log_tree_shrinks_when_emptied() {
        let tree = log_tree(4);
        for key in 0..200 {
            tree.put(key, key).unwrap();
        }
        assert!(tree.depth().unwrap() > 2);
        for key in (0..200).step_by(2).chain((1..200).step_by(2)) {
            assert_eq!(tree.remove(key).unwrap(), Some(key));
        }
        assert!(keys(&tree).is_empty());
        assert_eq!(tree.node_count().unwrap(), 1);
        assert_eq!(tree.depth().unwrap(), 1);
    }

    /// Storage whose appends or flushes fail while armed.
    struct FaultyStorage {
        inner: InMemoryStorage,
        fail_append: AtomicBool,
        fail_flush: AtomicBool,
    }

    impl FaultyStorage {
        fn new(header: StaticHeader) -> Self {
            Self {
                inner: InMemoryStorage::new(header),
                fail_append: AtomicBool::new(false),
                fail_flush: AtomicBool::new(false),
            }
        }
    }

    impl StorageBackend for FaultyStorage {
        fn static_header(&self) -> StaticHeader {
            self.inner.static_header()
        }

        fn dynamic_header(&self) -> crate::storage::DynamicHeader {
            self.inner.dynamic_header()
        }

        fn append(&self, bytes: &[u8]) -> Result<u64> {
            if self.fail_append.load(Ordering::SeqCst) {
                return Err(Error::OutOfSpace);
            }
            self.inner.append(bytes)
        }

        fn map(&self, offset: u64, len: usize) -> Result<crate::buffer::MappedPage> {
            self.inner.map(offset, len)
        }

        fn flush(&self, sync: bool) -> Result<()> {
            if self.fail_flush.load(Ordering::SeqCst) {
                return Err(Error::OutOfSpace);
            }
            self.inner.flush(sync)
        }

        fn append_offset(&self) -> u64 {
            self.inner.append_offset()
        }
    }

    fn faulty_tree() -> BTree<FaultyStorage> {
        let config = StoreConfig::builder().page_size(1024).segment_size(64 * 1024).build().unwrap();
        let header = StaticHeader::from_config(&config);
        let roots_header = header.with_segment_size(root_index_segment_size(header.segment_size));
        BTree::create(FaultyStorage::new(header), FaultyStorage::new(roots_header), &config).unwrap()
    }

    #[test]
    fn test_commit_retries_failed_root_append() {
        let tree = faulty_tree();
        tree.put(1, 10).unwrap();

        tree.root_index().storage().fail_append.store(true, Ordering::SeqCst);
        assert!(matches!(tree.commit(), Err(Error::OutOfSpace)));
        assert_eq!(tree.committed_version(), None);
        assert_eq!(tree.root_index().len(), 0);

        tree.root_index().storage().fail_append.store(false, Ordering::SeqCst);
        let record = tree.commit().unwrap().unwrap();
        assert_eq!(record.version, 0);
        assert_eq!(tree.committed_version(), Some(0));
        assert_eq!(tree.root_index().len(), 1);
        assert_eq!(tree.commit().unwrap(), None);
    }

    #[test]
    fn test_commit_retries_failed_root_flush_without_duplicates() {
        let tree = faulty_tree();
        tree.put(1, 10).unwrap();

        tree.root_index().storage().fail_flush.store(true, Ordering::SeqCst);
        assert!(tree.commit().is_err());
        assert_eq!(tree.committed_version(), None);

        tree.root_index().storage().fail_flush.store(false, Ordering::SeqCst);
        assert_eq!(tree.commit().unwrap().map(|record| record.version), Some(0));
        assert_eq!(tree.root_index().len(), 1);

        // A write made after a failed commit is recorded by the retry.
        tree.put(2, 20).unwrap();
        tree.root_index().storage().fail_flush.store(true, Ordering::SeqCst);
        assert!(tree.commit().is_err());
        tree.put(3, 30).unwrap();
        tree.root_index().storage().fail_flush.store(false, Ordering::SeqCst);
        assert_eq!(tree.commit().unwrap().map(|record| record.version), Some(2));
        let versions: Vec<u64> =
            tree.committed_roots().unwrap().iter().map(|record| record.version).collect();
        assert_eq!(versions, vec![0, 1, 2]);
        let snapshot = tree.committed_snapshot(2).unwrap().unwrap();
        assert_eq!(snapshot.get(3).unwrap(), Some(30));
    }

    #[test]
    fn test_stale_writer_is_rejected() {
        let tree = tree(10);
        tree.put(1, 1).unwrap();
        let stale = tree.current_root();
        tree.put(2, 2).unwrap();
        let root = Arc::new(Node::empty_leaf(NodeHeader::new(2, 0)));
        let result = tree.install(stale, root, 2, 0);
        assert!(matches!(result, Err(Error::ConcurrentModification { version: 2 })));
        assert_eq!(tree.get(2, None).unwrap(), Some(2));
    }
}

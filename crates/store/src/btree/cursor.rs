//! Tree positions and in-order iteration.
//!
//! Copy-on-write trees have no sibling links (linking a leaf to its neighbour would force the
//! neighbour to be copied on every change), so iteration keeps the path from the root to the
//! current leaf and climbs it when a leaf is exhausted.

use std::{
    ops::{Bound, RangeBounds},
    sync::Arc,
};

use super::{
    manager::NodeManager,
    node::{Node, NodeBody, NodeRef},
};
use crate::{error::Result, storage::StorageBackend};

/// One step of a root-to-leaf path: an internal node and the child taken from it.
#[derive(Debug, Clone)]
pub struct CursorPosition {
    /// Internal node on the path.
    pub node: Arc<Node>,
    /// Index of the child the path continues through.
    pub child_index: usize,
}

/// Key range of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    /// Lower bound.
    pub start: Bound<u64>,
    /// Upper bound.
    pub end: Bound<u64>,
}

impl KeyRange {
    /// Every key.
    pub fn all() -> Self {
        Self { start: Bound::Unbounded, end: Bound::Unbounded }
    }

    /// Copies the bounds of any standard range expression.
    pub fn from_bounds(bounds: impl RangeBounds<u64>) -> Self {
        Self { start: bounds.start_bound().cloned(), end: bounds.end_bound().cloned() }
    }

    /// Returns true if `key` is above the lower bound.
    pub fn after_start(&self, key: u64) -> bool {
        match self.start {
            Bound::Unbounded => true,
            Bound::Included(start) => key >= start,
            Bound::Excluded(start) => key > start,
        }
    }

    /// Returns true if `key` is below the upper bound.
    pub fn before_end(&self, key: u64) -> bool {
        match self.end {
            Bound::Unbounded => true,
            Bound::Included(end) => key <= end,
            Bound::Excluded(end) => key < end,
        }
    }

    /// Returns true if `key` is inside the range.
    pub fn contains(&self, key: u64) -> bool {
        self.after_start(key) && self.before_end(key)
    }

    fn seek_key(&self) -> Option<u64> {
        match self.start {
            Bound::Unbounded => None,
            Bound::Included(key) | Bound::Excluded(key) => Some(key),
        }
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

/// Iterator over `(key, value)` pairs of one tree version in ascending key order.
///
/// Nodes are resolved lazily as the iteration advances. Each item is a `Result` because a
/// stored node may fail verification when it is first loaded; iteration stops after the
/// first error.
pub struct BTreeIterator<'a, S: StorageBackend> {
    manager: &'a NodeManager<S>,
    range: KeyRange,
    stack: Vec<CursorPosition>,
    leaf: std::vec::IntoIter<(u64, u64)>,
    pending_root: Option<NodeRef>,
    done: bool,
}

impl<'a, S: StorageBackend> BTreeIterator<'a, S> {
    pub(crate) fn new(manager: &'a NodeManager<S>, root: Option<NodeRef>, range: KeyRange) -> Self {
        Self {
            manager,
            range,
            stack: Vec::new(),
            leaf: Vec::new().into_iter(),
            done: root.is_none(),
            pending_root: root,
        }
    }

    /// Descends from `node` to a leaf, following the seek key (or the leftmost edge).
    fn descend(&mut self, mut node: Arc<Node>, seek: Option<u64>) -> Result<()> {
        loop {
            let child = match &node.body {
                NodeBody::Leaf(leaf) => {
                    let range = self.range;
                    let entries: Vec<_> =
                        leaf.entries().into_iter().filter(|(key, _)| range.after_start(*key)).collect();
                    self.leaf = entries.into_iter();
                    return Ok(());
                },
                NodeBody::Internal(internal) => {
                    let child_index = seek.map_or(0, |key| internal.child_index(key));
                    let child = self.manager.resolve(&internal.children[child_index])?;
                    self.stack.push(CursorPosition { node: Arc::clone(&node), child_index });
                    child
                },
            };
            node = child;
        }
    }

    /// Moves to the leftmost leaf of the next subtree. Returns false at the end of the tree.
    fn next_leaf(&mut self) -> Result<bool> {
        while let Some(mut position) = self.stack.pop() {
            let Some(internal) = position.node.as_internal() else {
                continue;
            };
            position.child_index += 1;
            if position.child_index < internal.children.len() {
                let child = self.manager.resolve(&internal.children[position.child_index])?;
                self.stack.push(position);
                self.descend(child, None)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns the next entry, or `None` once the range is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if a node on the way cannot be loaded.
    pub fn next_entry(&mut self) -> Result<Option<(u64, u64)>> {
        if self.done {
            return Ok(None);
        }
        if let Some(root) = self.pending_root.take() {
            let root = self.manager.resolve(&root)?;
            self.descend(root, self.range.seek_key())?;
        }
        loop {
            if let Some((key, value)) = self.leaf.next() {
                if self.range.before_end(key) {
                    return Ok(Some((key, value)));
                }
                self.done = true;
                return Ok(None);
            }
            if !self.next_leaf()? {
                self.done = true;
                return Ok(None);
            }
        }
    }
}

impl<S: StorageBackend> Iterator for BTreeIterator<'_, S> {
    type Item = Result<(u64, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(entry) => entry.map(Ok),
            Err(err) => {
                self.done = true;
                Some(Err(err))
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_range_bounds() {
        let range = KeyRange::from_bounds(10..20);
        assert!(range.contains(10));
        assert!(range.contains(19));
        assert!(!range.contains(20));
        assert!(!range.contains(9));

        let range = KeyRange::from_bounds((Bound::Excluded(5), Bound::Included(7)));
        assert!(!range.contains(5));
        assert!(range.contains(7));
        assert_eq!(range.seek_key(), Some(5));

        let range = KeyRange::from_bounds(..);
        assert_eq!(range, KeyRange::all());
        assert!(range.contains(u64::MAX));
        assert_eq!(range.seek_key(), None);
    }
}

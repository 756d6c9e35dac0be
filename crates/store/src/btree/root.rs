//! Version chain of tree roots.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwapOption;

use super::node::NodeRef;

/// Milliseconds since the Unix epoch, saturating at zero for clocks set before it.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_millis() as u64)
}

/// One installed version of a tree.
///
/// References form a singly linked list from the newest version back to the oldest retained
/// one. Everything except the `previous` link is immutable; the link is cleared when older
/// versions are pruned.
pub struct RootReference {
    root: NodeRef,
    version: u64,
    timestamp: u64,
    previous: ArcSwapOption<RootReference>,
}

impl RootReference {
    /// Creates a reference superseding `previous`.
    pub fn new(
        root: NodeRef,
        version: u64,
        timestamp: u64,
        previous: Option<Arc<RootReference>>,
    ) -> Self {
        Self { root, version, timestamp, previous: ArcSwapOption::new(previous) }
    }

    /// Root node of this version.
    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    /// Version number.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Installation time in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The version this one superseded, if still retained.
    pub fn previous(&self) -> Option<Arc<RootReference>> {
        self.previous.load_full()
    }

    /// Walks back from this version to `version`. Returns `None` for future versions and for
    /// versions older than the oldest retained one.
    pub fn find(self: &Arc<Self>, version: u64) -> Option<Arc<RootReference>> {
        let mut current = Arc::clone(self);
        loop {
            if current.version == version {
                return Some(current);
            }
            if current.version < version {
                return None;
            }
            current = current.previous()?;
        }
    }

    /// Number of retained versions, this one included.
    pub fn chain_len(&self) -> usize {
        let mut len = 1;
        let mut next = self.previous();
        while let Some(reference) = next {
            len += 1;
            next = reference.previous();
        }
        len
    }

    /// Drops every version older than the newest `keep`. Returns the number of versions
    /// released from this chain.
    pub fn truncate(&self, keep: usize) -> usize {
        match keep {
            0 => 0,
            1 => self.detach_previous(),
            _ => {
                let Some(mut tail) = self.previous() else { return 0 };
                for _ in 2..keep {
                    match tail.previous() {
                        Some(next) => tail = next,
                        None => return 0,
                    }
                }
                tail.detach_previous()
            },
        }
    }

    fn detach_previous(&self) -> usize {
        match self.previous.swap(None) {
            Some(detached) => detached.chain_len(),
            None => 0,
        }
    }
}

impl std::fmt::Debug for RootReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootReference")
            .field("root", &self.root.page())
            .field("version", &self.version)
            .field("timestamp", &self.timestamp)
            .field("previous", &self.previous.load().as_ref().map(|previous| previous.version))
            .finish()
    }
}

impl Drop for RootReference {
    // Unlink iteratively so dropping a long history cannot overflow the stack.
    fn drop(&mut self) {
        let mut next = self.previous.swap(None);
        while let Some(reference) = next {
            next = match Arc::try_unwrap(reference) {
                Ok(reference) => reference.previous.swap(None),
                Err(_) => None,
            };
        }
    }
}

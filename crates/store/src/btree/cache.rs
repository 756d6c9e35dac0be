//! Decoded-node cache.
//!
//! Stored nodes are immutable, so a decoded node can be shared by every reader until it is
//! evicted. Uses clock eviction (approximate LRU) for low overhead.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use super::node::Node;
use crate::error::PageNumber;

struct CacheEntry {
    node: Arc<Node>,
    /// Second-chance bit for the clock sweep.
    accessed: bool,
}

#[derive(Default)]
struct ClockState {
    entries: HashMap<PageNumber, CacheEntry>,
    order: Vec<PageNumber>,
    hand: usize,
}

impl ClockState {
    fn evict_one(&mut self) {
        // Two sweeps always find a victim: the first clears every accessed bit.
        for _ in 0..self.order.len() * 2 {
            if self.hand >= self.order.len() {
                self.hand = 0;
            }
            let page = self.order[self.hand];
            match self.entries.get_mut(&page) {
                Some(entry) if entry.accessed => {
                    entry.accessed = false;
                    self.hand += 1;
                },
                _ => {
                    self.entries.remove(&page);
                    self.order.remove(self.hand);
                    return;
                },
            }
        }
    }
}

/// Node cache keyed by page number.
pub struct NodeCache {
    state: Mutex<ClockState>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl NodeCache {
    /// Creates a cache holding at most `capacity` nodes. Zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ClockState::default()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached node for `page`.
    pub fn get(&self, page: PageNumber) -> Option<Arc<Node>> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&page) {
            entry.accessed = true;
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(Arc::clone(&entry.node))
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Caches a node, evicting one entry when full.
    pub fn insert(&self, page: PageNumber, node: Arc<Node>) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&page) {
            entry.node = node;
            entry.accessed = true;
            return;
        }
        if state.entries.len() >= self.capacity {
            state.evict_one();
        }
        state.order.push(page);
        state.entries.insert(page, CacheEntry { node, accessed: true });
    }

    /// Drops every cached node.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.hand = 0;
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Current number of cached nodes.
    pub size: usize,
    /// Maximum capacity.
    pub capacity: usize,
    /// Total cache hits since creation.
    pub hits: u64,
    /// Total cache misses since creation.
    pub misses: u64,
}

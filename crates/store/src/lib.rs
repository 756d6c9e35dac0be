//! arbor-store: a versioned copy-on-write B+ tree over segmented append-only storage.
//!
//! - **Append-only**: pages and records are never rewritten; segments are pre-sized and
//!   mapped read-only
//! - **Versioned**: every write installs a new root; older roots stay readable until pruned
//! - **Lock-free reads**: readers load the current root atomically and never block writers
//! - **Checksummed**: every header, page and value record carries a configurable checksum
//! - **Root index**: one fixed-size record per commit locates each committed root
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Store API                    │
//! │   (put, get, get_at, remove, commit, close)  │
//! └──────────┬─────────────────────┬────────────┘
//!            │                     │
//! ┌──────────▼──────────┐ ┌────────▼────────────┐
//! │     Value Log       │ │  Async Index Writer │
//! │ (length, bytes, sum)│ │  (queue, batches)   │
//! └──────────┬──────────┘ └────────┬────────────┘
//!            │                     │
//!            │   ┌─────────────────▼────────────┐
//!            │   │          B+ Tree             │
//!            │   │ (COW writes, versions, iter) │
//!            │   └──────┬───────────────┬───────┘
//!            │          │               │
//!            │   ┌──────▼──────┐ ┌──────▼──────┐
//!            │   │Node Manager │ │ Root Index  │
//!            │   │(codec,cache)│ │(24-byte rec)│
//!            │   └──────┬──────┘ └──────┬──────┘
//!            │          │               │
//! ┌──────────▼──────────▼───────────────▼───────┐
//! │              Storage Backend                 │
//! │  (FileStorage segments / InMemoryStorage)    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use arbor_store::{Store, StoreConfig};
//!
//! let config = StoreConfig::builder().root_dir("/var/lib/arbor").build()?;
//! let store = Store::open(config)?;
//!
//! store.put(7u64, b"seven")?;
//! store.commit()?;
//!
//! assert_eq!(store.get(7u64)?.as_deref(), Some(&b"seven"[..]));
//! store.close()?;
//! # Ok::<(), arbor_store::Error>(())
//! ```
//!
//! The index can also be used on its own, mapping `u64` keys to `u64` values:
//!
//! ```
//! use arbor_store::{BTree, StoreConfig};
//!
//! let tree = BTree::in_memory(&StoreConfig::default())?;
//! tree.put(1, 100)?;
//! tree.put(2, 200)?;
//! let snapshot = tree.snapshot().expect("tree has a root");
//! tree.remove(1)?;
//!
//! assert_eq!(tree.get(1, None)?, None);
//! assert_eq!(snapshot.get(1)?, Some(100));
//! # Ok::<(), arbor_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod btree;
pub mod buffer;
pub mod checksum;
pub mod config;
pub mod error;
pub mod root_index;
pub mod storage;
pub mod store;
pub mod types;
pub mod value_log;
pub mod writer;

// Re-export commonly used types
pub use btree::{BTree, BTreeIterator, KeyRange, RootReference, Snapshot};
pub use buffer::{Endian, MappedPage, PageBuffer, PageRead};
pub use checksum::{Checksum, ChecksumType};
pub use config::{StoreConfig, VersionRetention};
pub use error::{Error, PageNumber, Result};
pub use root_index::{RootIndex, RootIndexRecord};
pub use storage::{FileStorage, InMemoryStorage, StorageBackend};
pub use store::{Store, StoreSnapshot};
pub use types::{Key, KeyType};
pub use value_log::ValueLog;
pub use writer::{IndexCommand, IndexWriter, PendingWrite};

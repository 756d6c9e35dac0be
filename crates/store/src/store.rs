//! Key-value store: a versioned index over an append-only value log.
//!
//! A store keeps three storages under its root directory:
//!
//! | Name     | Contents                                   |
//! |----------|--------------------------------------------|
//! | `values` | value records, addressed by offset         |
//! | `index`  | tree node pages mapping keys to offsets    |
//! | `roots`  | root index, one record per committed root  |
//!
//! Values are appended and flushed before the index commit that references them, so a
//! committed index never points past the durable end of the value log.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::{
    btree::{BTree, Snapshot},
    config::StoreConfig,
    error::{Error, Result},
    root_index::root_index_segment_size,
    storage::{FileStorage, InMemoryStorage, StaticHeader, StorageBackend},
    types::Key,
    value_log::ValueLog,
    writer::{CommitHook, IndexCommand, IndexWriter},
};

const VALUES: &str = "values";
const INDEX: &str = "index";
const ROOTS: &str = "roots";

/// Versioned key-value store.
///
/// With [`StoreConfig::async_index_write`], `put` and `remove` append the value and queue
/// the index change without waiting; reads see the change once the background writer
/// applied it, and [`commit`](Self::commit) waits for everything queued so far.
pub struct Store<S: StorageBackend + 'static = FileStorage> {
    values: Arc<ValueLog<S>>,
    tree: Arc<BTree<S>>,
    writer: Option<IndexWriter<S>>,
    write_lock: Mutex<()>,
    sync_on_commit: bool,
}

impl Store<FileStorage> {
    /// Opens the store under `config.root_dir`, creating its storages on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `root_dir` is unset or the existing storages were
    /// created with different page parameters. Returns a corruption error if the newest
    /// committed root fails verification.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let Some(root_dir) = config.root_dir.clone() else {
            return Err(Error::InvalidConfig { reason: "root_dir is required".to_string() });
        };
        if !root_dir.is_dir() {
            return Err(Error::InvalidConfig {
                reason: format!("root_dir {} is not a directory", root_dir.display()),
            });
        }
        let header = StaticHeader::from_config(&config);
        let roots_header = header.with_segment_size(root_index_segment_size(header.segment_size));
        let values = FileStorage::open_or_create(&root_dir, VALUES, header)?;
        let index = FileStorage::open_or_create(&root_dir, INDEX, header)?;
        let roots = FileStorage::open_or_create(&root_dir, ROOTS, roots_header)?;
        let store = Self::assemble(values, BTree::open(index, roots, &config)?, &config)?;
        info!(
            root_dir = %root_dir.display(),
            version = ?store.tree.committed_version(),
            async_index_write = config.async_index_write,
            "Opened store"
        );
        Ok(store)
    }
}

impl Store<InMemoryStorage> {
    /// Creates an empty store over in-memory storages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is invalid.
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let values = InMemoryStorage::new(StaticHeader::from_config(&config));
        Self::assemble(values, BTree::in_memory(&config)?, &config)
    }
}

impl<S: StorageBackend + 'static> Store<S> {
    fn assemble(values: S, tree: BTree<S>, config: &StoreConfig) -> Result<Self> {
        let values = Arc::new(ValueLog::new(values));
        let tree = Arc::new(tree);
        let sync_on_commit = config.sync_on_commit;
        let writer = if config.async_index_write {
            let log = Arc::clone(&values);
            let hook: CommitHook = Box::new(move || log.flush(sync_on_commit));
            Some(IndexWriter::spawn(Arc::clone(&tree), config.queue_capacity, Some(hook))?)
        } else {
            None
        };
        Ok(Self { values, tree, writer, write_lock: Mutex::new(()), sync_on_commit })
    }

    /// The index tree.
    pub fn tree(&self) -> &Arc<BTree<S>> {
        &self.tree
    }

    /// The value log.
    pub fn values(&self) -> &ValueLog<S> {
        &self.values
    }

    /// Current index version, or `None` before the first write.
    pub fn version(&self) -> Option<u64> {
        self.tree.version()
    }

    /// Stores `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns any error raised while appending the value or updating the index. In async
    /// mode index errors are reported by the next [`commit`](Self::commit) instead.
    pub fn put(&self, key: impl Key, value: &[u8]) -> Result<()> {
        let offset = self.values.append(value)?;
        self.apply(IndexCommand::Put { key: key.to_ordered(), value: offset })
    }

    /// Removes `key`. Removing an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put).
    pub fn remove(&self, key: impl Key) -> Result<()> {
        self.apply(IndexCommand::Remove { key: key.to_ordered() })
    }

    fn apply(&self, command: IndexCommand) -> Result<()> {
        if let Some(writer) = &self.writer {
            drop(writer.submit(command)?);
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        match command {
            IndexCommand::Put { key, value } => self.tree.put(key, value)?,
            IndexCommand::Remove { key } => self.tree.remove(key)?,
        };
        Ok(())
    }

    /// Returns the value stored under `key` in the current version.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if an index page or the value record fails verification.
    pub fn get(&self, key: impl Key) -> Result<Option<Vec<u8>>> {
        self.tree.get(key.to_ordered(), None)?.map(|offset| self.values.read(offset)).transpose()
    }

    /// Returns the value stored under `key` as of `version`, or `None` if that version is
    /// no longer (or not yet) retained in memory.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub fn get_at(&self, key: impl Key, version: u64) -> Result<Option<Vec<u8>>> {
        self.tree
            .get(key.to_ordered(), Some(version))?
            .map(|offset| self.values.read(offset))
            .transpose()
    }

    /// Makes every write so far durable and returns the committed version.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from any storage, or in async mode the first failure of a
    /// queued command since the previous commit.
    pub fn commit(&self) -> Result<Option<u64>> {
        if let Some(writer) = &self.writer {
            writer.sync()?;
            return Ok(self.tree.committed_version());
        }
        let _guard = self.write_lock.lock();
        self.values.flush(self.sync_on_commit)?;
        self.tree.commit()?;
        Ok(self.tree.committed_version())
    }

    /// Read-only view of the current version.
    pub fn snapshot(&self) -> Option<StoreSnapshot<'_, S>> {
        self.tree.snapshot().map(|index| StoreSnapshot { index, values: &self.values })
    }

    /// Stops the background writer and commits outstanding writes.
    ///
    /// # Errors
    ///
    /// Same as [`commit`](Self::commit).
    pub fn close(mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.sync()?;
            writer.shutdown()?;
        }
        self.commit()?;
        info!(version = ?self.tree.committed_version(), "Closed store");
        Ok(())
    }
}

/// Read-only view of one store version.
pub struct StoreSnapshot<'a, S: StorageBackend> {
    index: Snapshot<'a, S>,
    values: &'a ValueLog<S>,
}

impl<S: StorageBackend> StoreSnapshot<'_, S> {
    /// Version of this view.
    pub fn version(&self) -> u64 {
        self.index.version()
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: impl Key) -> Result<Option<Vec<u8>>> {
        self.index.get(key.to_ordered())?.map(|offset| self.values.read(offset)).transpose()
    }

    /// Every entry in key order. Keys outside the domain of `K` are skipped.
    pub fn entries<K: Key>(&self) -> Result<Vec<(K, Vec<u8>)>> {
        let mut entries = Vec::new();
        for entry in self.index.iter() {
            let (raw, offset) = entry?;
            if let Some(key) = K::from_ordered(raw) {
                entries.push((key, self.values.read(offset)?));
            }
        }
        Ok(entries)
    }
}

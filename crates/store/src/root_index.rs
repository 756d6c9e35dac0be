//! Commit log of tree roots.
//!
//! One fixed-size [`RootIndexRecord`] is appended per commit to a dedicated storage. The
//! record count and the latest record follow directly from the storage's append offset, so
//! opening a tree finds its newest committed root without scanning the tree storage.
//!
//! ## Record layout (24 bytes)
//!
//! | Offset | Size | Field                           |
//! |--------|------|---------------------------------|
//! | 0      | 8    | Commit version                  |
//! | 8      | 8    | Timestamp (ms since Unix epoch) |
//! | 16     | 8    | Byte offset of the root page    |

use tracing::trace;

use crate::{
    buffer::{PageBuffer, PageRead},
    error::{Error, PageNumber, Result},
    storage::StorageBackend,
};

/// Size of one encoded record.
pub const ROOT_RECORD_SIZE: usize = 24;

/// Largest segment size not above `segment_size` that holds whole records.
pub fn root_index_segment_size(segment_size: u64) -> u64 {
    let record = ROOT_RECORD_SIZE as u64;
    (segment_size - segment_size % record).max(record)
}

/// Location of one committed root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootIndexRecord {
    /// Version of the committed root.
    pub version: u64,
    /// Commit time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Byte offset of the root page in the tree storage.
    pub offset: u64,
}

impl RootIndexRecord {
    /// Page number of the root, given the tree page size.
    pub fn page(&self, page_size: usize) -> PageNumber {
        self.offset / page_size as u64
    }
}

/// Append-only sequence of [`RootIndexRecord`]s.
pub struct RootIndex<S: StorageBackend> {
    storage: S,
}

impl<S: StorageBackend> RootIndex<S> {
    /// Wraps a storage dedicated to root records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the segment size is not a multiple of the record
    /// size, since records must sit at fixed positions.
    /// Returns [`Error::Corrupted`] if the storage length is not a whole number of records.
    pub fn new(storage: S) -> Result<Self> {
        let segment_size = storage.static_header().segment_size;
        if segment_size % ROOT_RECORD_SIZE as u64 != 0 {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "root index segment size {segment_size} is not a multiple of {ROOT_RECORD_SIZE}"
                ),
            });
        }
        if storage.append_offset() % ROOT_RECORD_SIZE as u64 != 0 {
            return Err(Error::Corrupted {
                reason: format!(
                    "root index length {} is not a multiple of {ROOT_RECORD_SIZE}",
                    storage.append_offset()
                ),
            });
        }
        Ok(Self { storage })
    }

    /// The underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Number of records.
    pub fn len(&self) -> u64 {
        self.storage.append_offset() / ROOT_RECORD_SIZE as u64
    }

    /// Returns true if no root was ever committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a record. Not durable until [`flush`](Self::flush).
    pub fn append(&self, record: RootIndexRecord) -> Result<()> {
        let mut buf = PageBuffer::new(ROOT_RECORD_SIZE, self.storage.endian());
        buf.put_u64(0, record.version)?;
        buf.put_u64(8, record.timestamp)?;
        buf.put_u64(16, record.offset)?;
        self.storage.append(buf.as_bytes())?;
        Ok(())
    }

    /// Persists appended records.
    pub fn flush(&self, sync: bool) -> Result<()> {
        self.storage.flush(sync)
    }

    /// The `n`-th record, oldest first.
    pub fn record(&self, n: u64) -> Result<Option<RootIndexRecord>> {
        if n >= self.len() {
            return Ok(None);
        }
        let page = self.storage.map(n * ROOT_RECORD_SIZE as u64, ROOT_RECORD_SIZE)?;
        Ok(Some(RootIndexRecord {
            version: page.get_u64(0)?,
            timestamp: page.get_u64(8)?,
            offset: page.get_u64(16)?,
        }))
    }

    /// Newest record.
    pub fn latest(&self) -> Result<Option<RootIndexRecord>> {
        match self.len() {
            0 => Ok(None),
            n => self.record(n - 1),
        }
    }

    /// Record of an exact version, by binary search over the increasing versions.
    pub fn find(&self, version: u64) -> Result<Option<RootIndexRecord>> {
        let (mut lo, mut hi) = (0u64, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let Some(record) = self.record(mid)? else { break };
            trace!(probe = mid, version = record.version, "Root index probe");
            match record.version.cmp(&version) {
                std::cmp::Ordering::Equal => return Ok(Some(record)),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    /// All records, oldest first.
    pub fn records(&self) -> Result<Vec<RootIndexRecord>> {
        (0..self.len()).filter_map(|n| self.record(n).transpose()).collect()
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

    fn index(segment_size: u64) -> RootIndex<InMemoryStorage> {
        let config = StoreConfig::builder().page_size(512).segment_size(4096).build().unwrap();
        let header = StaticHeader::from_config(&config).with_segment_size(segment_size);
        RootIndex::new(InMemoryStorage::new(header)).unwrap()
    }

    fn record(version: u64) -> RootIndexRecord {
        RootIndexRecord { version, timestamp: 1_700_000_000_000 + version, offset: version * 512 }
    }

    #[test]
    fn test_segment_size_rounding() {
        assert_eq!(root_index_segment_size(4096), 4080);
        assert_eq!(root_index_segment_size(48), 48);
        assert_eq!(root_index_segment_size(10), 24);
    }

    #[test]
    fn test_empty_index() {
        let index = index(240);
        assert!(index.is_empty());
        assert_eq!(index.latest().unwrap(), None);
        assert_eq!(index.find(0).unwrap(), None);
    }

    #[test]
    fn test_append_and_lookup_across_segments() {
        // Ten records per segment.
        let index = index(240);
        for version in (0..50).map(|v| v * 2) {
            index.append(record(version)).unwrap();
        }
        assert_eq!(index.len(), 50);
        assert_eq!(index.record(0).unwrap(), Some(record(0)));
        assert_eq!(index.record(37).unwrap(), Some(record(74)));
        assert_eq!(index.record(50).unwrap(), None);
        assert_eq!(index.latest().unwrap(), Some(record(98)));
        assert_eq!(index.find(42).unwrap(), Some(record(42)));
        assert_eq!(index.find(43).unwrap(), None);
        assert_eq!(index.find(1000).unwrap(), None);
        assert_eq!(index.records().unwrap().len(), 50);
    }

    #[test]
    fn test_rejects_misaligned_segment_size() {
        let config = StoreConfig::builder().page_size(512).segment_size(4096).build().unwrap();
        let header = StaticHeader::from_config(&config);
        assert!(matches!(
            RootIndex::new(InMemoryStorage::new(header)),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_record_page_number() {
        assert_eq!(record(3).page(512), 3);
    }
}

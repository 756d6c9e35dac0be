//! In-memory storage for tests and ephemeral trees.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{AppendCursor, DynamicHeader, StaticHeader, StorageBackend};
use crate::{
    buffer::MappedPage,
    error::{Error, Result},
};

/// In-memory storage.
///
/// Follows the same segment and header rules as [`FileStorage`](super::FileStorage) so
/// trees behave identically on both, but all data is lost when the storage is dropped.
/// Mapped pages are copies rather than zero-copy windows.
pub struct InMemoryStorage {
    static_header: StaticHeader,
    segments: RwLock<Vec<Vec<u8>>>,
    state: Mutex<(AppendCursor, DynamicHeader)>,
    flushes: Mutex<u64>,
}

impl InMemoryStorage {
    /// Creates an empty storage.
    pub fn new(static_header: StaticHeader) -> Self {
        let header = DynamicHeader::default();
        Self {
            static_header,
            segments: RwLock::new(Vec::new()),
            state: Mutex::new((AppendCursor::new(&header, static_header.segment_size), header)),
            flushes: Mutex::new(0),
        }
    }

    /// Number of segments holding data.
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Number of durable flushes requested so far.
    pub fn sync_count(&self) -> u64 {
        *self.flushes.lock()
    }
}

impl StorageBackend for InMemoryStorage {
    fn static_header(&self) -> StaticHeader {
        self.static_header
    }

    fn dynamic_header(&self) -> DynamicHeader {
        self.state.lock().1
    }

    fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut state = self.state.lock();
        let mut cursor = state.0;
        let reservation = cursor.reserve(bytes.len())?;
        if !bytes.is_empty() {
            let mut segments = self.segments.write();
            while segments.len() as u64 <= reservation.segment {
                segments.push(Vec::new());
            }
            let segment = &mut segments[reservation.segment as usize];
            let start = reservation.local as usize;
            let end = start + bytes.len();
            if segment.len() < end {
                segment.resize(end, 0);
            }
            segment[start..end].copy_from_slice(bytes);
        }
        state.0 = cursor;
        Ok(reservation.offset)
    }

    fn map(&self, offset: u64, len: usize) -> Result<MappedPage> {
        let (segment, local) = self.state.lock().0.locate(offset, len)?;
        let segments = self.segments.read();
        let bytes = segments
            .get(segment as usize)
            .and_then(|data| data.get(local..local + len))
            .ok_or_else(|| Error::Corrupted { reason: format!("segment {segment} missing data") })?;
        Ok(MappedPage::heap(Arc::from(bytes), self.static_header.endian))
    }

    fn flush(&self, sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        let (cursor, header) = *state;
        if sync {
            *self.flushes.lock() += 1;
        }
        if cursor.global() != header.global_offset || cursor.local() != header.local_offset {
            state.1 = header.next(cursor.global(), cursor.local());
        }
        Ok(())
    }

    fn append_offset(&self) -> u64 {
        self.state.lock().0.global()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{buffer::PageRead, config::StoreConfig};

    fn storage(segment_size: u64) -> InMemoryStorage {
        let config =
            StoreConfig::builder().page_size(512).segment_size(segment_size).build().unwrap();
        InMemoryStorage::new(StaticHeader::from_config(&config))
    }

    #[test]
    fn test_append_and_map() {
        let storage = storage(4096);
        let offset = storage.append(b"abc").unwrap();
        assert_eq!(offset, 0);
        assert_eq!(storage.map(0, 3).unwrap().as_bytes(), b"abc");
        assert_eq!(storage.append_offset(), 3);
    }

    #[test]
    fn test_rolls_like_file_storage() {
        let storage = storage(1024);
        storage.append(&[1u8; 1000]).unwrap();
        let offset = storage.append(&[2u8; 100]).unwrap();
        assert_eq!(offset, 1024);
        assert_eq!(storage.segment_count(), 2);
        assert_eq!(storage.read(1024, 100).unwrap(), vec![2u8; 100]);
    }

    #[test]
    fn test_flush_advances_dynamic_header() {
        let storage = storage(4096);
        storage.flush(true).unwrap();
        assert_eq!(storage.dynamic_header().append_version, 0);
        storage.append(&[0u8; 10]).unwrap();
        storage.flush(true).unwrap();
        let header = storage.dynamic_header();
        assert_eq!((header.append_version, header.global_offset), (1, 10));
        assert_eq!(storage.sync_count(), 2);
    }

    #[test]
    fn test_map_out_of_range() {
        let storage = storage(4096);
        storage.append(&[0u8; 10]).unwrap();
        assert!(matches!(storage.map(5, 10), Err(Error::OffsetOutOfRange { .. })));
    }
}

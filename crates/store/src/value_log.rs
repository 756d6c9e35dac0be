//! Append-only value log.
//!
//! Values are stored out of line; the tree keeps only the offset returned by
//! [`ValueLog::append`]. Each record is `u32 length | payload | checksum`, with the checksum
//! covering length and payload.

use crate::{
    buffer::{PageBuffer, PageRead},
    checksum::ChecksumType,
    error::{Error, Result},
    storage::StorageBackend,
};

const LENGTH_SIZE: usize = 4;

/// Append-only store of value bytes addressed by offset.
pub struct ValueLog<S: StorageBackend> {
    storage: S,
    checksum: ChecksumType,
}

impl<S: StorageBackend> ValueLog<S> {
    /// Wraps a storage dedicated to values.
    pub fn new(storage: S) -> Self {
        let checksum = storage.checksum();
        Self { storage, checksum }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Size of the record holding a payload of `len` bytes.
    pub fn record_size(&self, len: usize) -> usize {
        LENGTH_SIZE + len + self.checksum.value_size()
    }

    /// Appends a value, returning its offset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordTooLarge`] if the record does not fit one segment.
    pub fn append(&self, value: &[u8]) -> Result<u64> {
        let len = u32::try_from(value.len()).map_err(|_| Error::RecordTooLarge {
            size: value.len(),
            max: u32::MAX as usize,
        })?;
        let mut buf = PageBuffer::new(self.record_size(value.len()), self.storage.endian());
        buf.put_u32(0, len)?;
        buf.put_bytes(LENGTH_SIZE, value)?;
        let sum = self.checksum.compute(&[&buf.as_bytes()[..LENGTH_SIZE + value.len()]]);
        buf.put_bytes(LENGTH_SIZE + value.len(), &sum)?;
        self.storage.append(buf.as_bytes())
    }

    /// Reads the value stored at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetOutOfRange`] if the record extends past the log end.
    /// Returns [`Error::ValueChecksumMismatch`] if the record is damaged.
    pub fn read(&self, offset: u64) -> Result<Vec<u8>> {
        let len = self.storage.map(offset, LENGTH_SIZE)?.get_u32(0)? as usize;
        let record = self.storage.map(offset, self.record_size(len))?;
        let body = record.get_bytes(0, LENGTH_SIZE + len)?;
        let stored = record.get_bytes(LENGTH_SIZE + len, self.checksum.value_size())?;
        let mut state = self.checksum.create();
        state.update(body);
        if !state.compare(stored) {
            return Err(Error::ValueChecksumMismatch { offset });
        }
        Ok(body[LENGTH_SIZE..].to_vec())
    }

    /// Persists appended values.
    pub fn flush(&self, sync: bool) -> Result<()> {
        self.storage.flush(sync)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::{
        config::StoreConfig,
        storage::{FileStorage, InMemoryStorage, StaticHeader},
    };

    fn header(checksum: ChecksumType) -> StaticHeader {
        let config = StoreConfig::builder()
            .page_size(512)
            .segment_size(1024)
            .checksum(checksum)
            .build()
            .unwrap();
        StaticHeader::from_config(&config)
    }

    #[test]
    fn test_append_read() {
        let log = ValueLog::new(InMemoryStorage::new(header(ChecksumType::Crc32)));
        let a = log.append(b"first value").unwrap();
        let b = log.append(b"").unwrap();
        let c = log.append(&[0xEE; 300]).unwrap();
        assert_eq!(log.read(a).unwrap(), b"first value");
        assert_eq!(log.read(b).unwrap(), b"");
        assert_eq!(log.read(c).unwrap(), vec![0xEE; 300]);
    }

    #[test]
    fn test_records_never_straddle_segments() {
        let log = ValueLog::new(InMemoryStorage::new(header(ChecksumType::Sha256)));
        let mut offsets = Vec::new();
        for i in 0..10u8 {
            offsets.push(log.append(&[i; 200]).unwrap());
        }
        for (i, offset) in offsets.into_iter().enumerate() {
            assert!(offset % 1024 + log.record_size(200) as u64 <= 1024);
            assert_eq!(log.read(offset).unwrap(), vec![i as u8; 200]);
        }
    }

    #[test]
    fn test_value_larger_than_segment() {
        let log = ValueLog::new(InMemoryStorage::new(header(ChecksumType::Crc32)));
        assert!(matches!(log.append(&[0; 2000]), Err(Error::RecordTooLarge { .. })));
    }

    #[test]
    fn test_detects_corruption() {
        let dir = tempdir().unwrap();
        let offset = {
            let storage = FileStorage::create(dir.path(), "values", header(ChecksumType::Xxh3)).unwrap();
            let log = ValueLog::new(storage);
            let offset = log.append(b"precious").unwrap();
            log.flush(true).unwrap();
            offset
        };
        let path = dir.path().join("values.000000");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[offset as usize + 6] ^= 0x20;
        std::fs::write(&path, bytes).unwrap();

        let log = ValueLog::new(FileStorage::open(dir.path(), "values").unwrap());
        assert!(matches!(log.read(offset), Err(Error::ValueChecksumMismatch { offset: 0 })));
    }

    #[test]
    fn test_read_past_end() {
        let log = ValueLog::new(InMemoryStorage::new(header(ChecksumType::Crc32)));
        log.append(b"x").unwrap();
        assert!(matches!(log.read(100), Err(Error::OffsetOutOfRange { .. })));
    }
}

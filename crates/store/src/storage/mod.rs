//! Page-addressed append-only storage.
//!
//! A storage is a logically continuous byte stream split across fixed-size segment files.
//! Offsets are global: offset `o` lives in segment `o / segment_size` at local offset
//! `o % segment_size`. An append never straddles two segments; when the remaining space in
//! the current segment is too small the cursor rolls to the next segment boundary and the
//! tail of the old segment is left unused.
//!
//! Durability is controlled by [`StorageBackend::flush`]: appended bytes become part of
//! the recoverable stream only once a dynamic header describing them has been written.
//! Anything past the last valid dynamic header is ignored on open and overwritten by the
//! next append.

pub mod file;
pub mod header;
pub mod memory;

pub use file::FileStorage;
pub use header::{DynamicHeader, StaticHeader};
pub use memory::InMemoryStorage;

use crate::{
    buffer::{Endian, MappedPage, PageRead},
    checksum::ChecksumType,
    error::{Error, PageNumber, Result},
};

/// Append-only storage with read-only page mapping.
///
/// Implementations must be thread-safe: readers call [`map`](Self::map) concurrently with a
/// single appending writer.
pub trait StorageBackend: Send + Sync {
    /// Immutable parameters recorded at creation.
    fn static_header(&self) -> StaticHeader;

    /// Last dynamic header written by [`flush`](Self::flush) (or loaded on open).
    fn dynamic_header(&self) -> DynamicHeader;

    /// Appends `bytes`, returning the global offset they were written at.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordTooLarge`] if `bytes` exceeds the segment size.
    /// Returns [`Error::Io`] if the write fails.
    fn append(&self, bytes: &[u8]) -> Result<u64>;

    /// Maps `len` bytes at a global offset as a read-only page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetOutOfRange`] if the range ends past the append offset.
    fn map(&self, offset: u64, len: usize) -> Result<MappedPage>;

    /// Persists the append position in the next dynamic header slot, optionally forcing
    /// segment data and header to stable storage first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a write or sync fails.
    fn flush(&self, sync: bool) -> Result<()>;

    /// Global offset of the next append.
    fn append_offset(&self) -> u64;

    /// Page size in bytes.
    fn page_size(&self) -> usize {
        self.static_header().page_size as usize
    }

    /// Byte order of the storage.
    fn endian(&self) -> Endian {
        self.static_header().endian
    }

    /// Checksum algorithm of the storage.
    fn checksum(&self) -> ChecksumType {
        self.static_header().checksum
    }

    /// Maps one full page by page number.
    fn map_page(&self, page: PageNumber) -> Result<MappedPage> {
        let page_size = self.page_size();
        let offset = page.checked_mul(page_size as u64).ok_or(Error::OutOfSpace)?;
        self.map(offset, page_size)
    }

    /// Copies `len` bytes at a global offset.
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        Ok(self.map(offset, len)?.as_bytes().to_vec())
    }
}

/// Header file name of a storage.
pub(crate) fn header_file_name(name: &str) -> String {
    format!("{name}.header")
}

/// Segment file name of a storage.
pub(crate) fn segment_file_name(name: &str, index: u64) -> String {
    format!("{name}.{index:06}")
}

/// Resolves a global range to `(segment, local offset)`, rejecting ranges that end past
/// `limit` or cross a segment boundary.
pub(crate) fn locate(offset: u64, len: usize, limit: u64, segment_size: u64) -> Result<(u64, usize)> {
    let len64 = len as u64;
    match offset.checked_add(len64) {
        Some(end) if end <= limit => {},
        _ => return Err(Error::OffsetOutOfRange { offset, len: len64, limit }),
    }
    let segment = offset / segment_size;
    let local = offset % segment_size;
    if local + len64 > segment_size {
        return Err(Error::Corrupted {
            reason: format!("range {offset}+{len} straddles segment {segment}"),
        });
    }
    Ok((segment, local as usize))
}

/// Where an append landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reservation {
    /// Global offset of the first byte.
    pub offset: u64,
    /// Segment index.
    pub segment: u64,
    /// Offset inside the segment.
    pub local: u64,
    /// The cursor skipped the tail of the previous segment.
    pub rolled: bool,
}

/// Append position shared by every storage implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AppendCursor {
    global: u64,
    local: u64,
    segment_size: u64,
}

impl AppendCursor {
    pub(crate) fn new(header: &DynamicHeader, segment_size: u64) -> Self {
        Self { global: header.global_offset, local: header.local_offset, segment_size }
    }

    pub(crate) fn global(&self) -> u64 {
        self.global
    }

    pub(crate) fn local(&self) -> u64 {
        self.local
    }

    /// Reserves room for `len` bytes, rolling to the next segment when needed.
    pub(crate) fn reserve(&mut self, len: usize) -> Result<Reservation> {
        let len64 = len as u64;
        if len64 > self.segment_size {
            return Err(Error::RecordTooLarge { size: len, max: self.segment_size as usize });
        }
        let mut rolled = false;
        if len64 > 0 && self.local + len64 > self.segment_size {
            let skip = self.segment_size - self.local;
            self.global = self.global.checked_add(skip).ok_or(Error::OutOfSpace)?;
            self.local = 0;
            rolled = true;
        }
        let offset = self.global;
        let reservation =
            Reservation { offset, segment: offset / self.segment_size, local: self.local, rolled };
        self.global = offset.checked_add(len64).ok_or(Error::OutOfSpace)?;
        self.local += len64;
        Ok(reservation)
    }

    /// Resolves a global range against this cursor.
    pub(crate) fn locate(&self, offset: u64, len: usize) -> Result<(u64, usize)> {
        locate(offset, len, self.global, self.segment_size)
    }

    /// Number of segments holding data below the cursor.
    pub(crate) fn segment_count(&self) -> u64 {
        self.global.div_ceil(self.segment_size)
    }
}

//! Byte-order aware page buffers.
//!
//! Two buffer kinds exist:
//!
//! - [`PageBuffer`]: an owned, mutable heap page used while encoding nodes and headers.
//! - [`MappedPage`]: a read-only window over a memory-mapped segment (or a shared heap copy
//!   for in-memory storage). Reads are zero-copy for file-backed storage.
//!
//! Both implement [`PageRead`], which provides bounds-checked integer and byte-range access
//! in the byte order the storage was created with. Out-of-range access is reported as
//! [`Error::PageOverflow`] instead of panicking, so a corrupt length field can never walk
//! off the end of a page.

use std::{fmt, ops::Range, sync::Arc};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use memmap2::Mmap;

use crate::error::{Error, Result};

/// Byte order of every multi-byte integer in a storage instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endian {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

impl Endian {
    /// Single-byte encoding stored in the static header.
    pub fn to_byte(self) -> u8 {
        match self {
            Endian::Little => 0,
            Endian::Big => 1,
        }
    }

    /// Decodes the static header byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Endian::Little),
            1 => Ok(Endian::Big),
            other => Err(Error::Corrupted { reason: format!("invalid byte order tag {other}") }),
        }
    }

    /// Byte order of the running machine.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") { Endian::Big } else { Endian::Little }
    }

    fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(buf),
            Endian::Big => BigEndian::read_u16(buf),
        }
    }

    fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(buf),
            Endian::Big => BigEndian::read_u32(buf),
        }
    }

    fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(buf),
            Endian::Big => BigEndian::read_u64(buf),
        }
    }

    fn write_u16(self, buf: &mut [u8], value: u16) {
        match self {
            Endian::Little => LittleEndian::write_u16(buf, value),
            Endian::Big => BigEndian::write_u16(buf, value),
        }
    }

    fn write_u32(self, buf: &mut [u8], value: u32) {
        match self {
            Endian::Little => LittleEndian::write_u32(buf, value),
            Endian::Big => BigEndian::write_u32(buf, value),
        }
    }

    fn write_u64(self, buf: &mut [u8], value: u64) {
        match self {
            Endian::Little => LittleEndian::write_u64(buf, value),
            Endian::Big => BigEndian::write_u64(buf, value),
        }
    }
}

impl fmt::Display for Endian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endian::Little => f.write_str("little-endian"),
            Endian::Big => f.write_str("big-endian"),
        }
    }
}

fn checked_range(offset: usize, len: usize, size: usize) -> Result<Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(Error::PageOverflow { offset, len, size }),
    }
}

/// Read access shared by heap and mapped pages.
pub trait PageRead {
    /// The full byte content of the page.
    fn as_bytes(&self) -> &[u8];

    /// Byte order used for integer access.
    fn endian(&self) -> Endian;

    /// Page length in bytes.
    fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Returns true for a zero-length page.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads one byte.
    fn get_u8(&self, offset: usize) -> Result<u8> {
        let range = checked_range(offset, 1, self.len())?;
        Ok(self.as_bytes()[range.start])
    }

    /// Reads a 16-bit integer.
    fn get_u16(&self, offset: usize) -> Result<u16> {
        let range = checked_range(offset, 2, self.len())?;
        Ok(self.endian().read_u16(&self.as_bytes()[range]))
    }

    /// Reads a 32-bit integer.
    fn get_u32(&self, offset: usize) -> Result<u32> {
        let range = checked_range(offset, 4, self.len())?;
        Ok(self.endian().read_u32(&self.as_bytes()[range]))
    }

    /// Reads a 64-bit integer.
    fn get_u64(&self, offset: usize) -> Result<u64> {
        let range = checked_range(offset, 8, self.len())?;
        Ok(self.endian().read_u64(&self.as_bytes()[range]))
    }

    /// Borrows a byte range.
    fn get_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let range = checked_range(offset, len, self.len())?;
        Ok(&self.as_bytes()[range])
    }
}

/// Owned, mutable page.
#[derive(Clone, PartialEq, Eq)]
pub struct PageBuffer {
    data: Vec<u8>,
    endian: Endian,
}

impl PageBuffer {
    /// Allocates a zero-filled page.
    pub fn new(size: usize, endian: Endian) -> Self {
        Self { data: vec![0u8; size], endian }
    }

    /// Wraps existing bytes.
    pub fn from_vec(data: Vec<u8>, endian: Endian) -> Self {
        Self { data, endian }
    }

    /// Mutable access to the raw bytes.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consumes the buffer, returning its bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Writes one byte.
    pub fn put_u8(&mut self, offset: usize, value: u8) -> Result<()> {
        let range = checked_range(offset, 1, self.data.len())?;
        self.data[range.start] = value;
        Ok(())
    }

    /// Writes a 16-bit integer.
    pub fn put_u16(&mut self, offset: usize, value: u16) -> Result<()> {
        let range = checked_range(offset, 2, self.data.len())?;
        self.endian.write_u16(&mut self.data[range], value);
        Ok(())
    }

    /// Writes a 32-bit integer.
    pub fn put_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        let range = checked_range(offset, 4, self.data.len())?;
        self.endian.write_u32(&mut self.data[range], value);
        Ok(())
    }

    /// Writes a 64-bit integer.
    pub fn put_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        let range = checked_range(offset, 8, self.data.len())?;
        self.endian.write_u64(&mut self.data[range], value);
        Ok(())
    }

    /// Copies a byte range into the page.
    pub fn put_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let range = checked_range(offset, bytes.len(), self.data.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Zeroes a byte range.
    pub fn clear_range(&mut self, offset: usize, len: usize) -> Result<()> {
        let range = checked_range(offset, len, self.data.len())?;
        self.data[range].fill(0);
        Ok(())
    }
}

impl PageRead for PageBuffer {
    fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn endian(&self) -> Endian {
        self.endian
    }
}

impl fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuffer")
            .field("len", &self.data.len())
            .field("endian", &self.endian)
            .finish()
    }
}

#[derive(Clone)]
enum Backing {
    Mapped(Arc<Mmap>),
    Heap(Arc<[u8]>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(map) => &map[..],
            Backing::Heap(bytes) => &bytes[..],
        }
    }
}

/// Read-only window onto a storage segment.
///
/// Holds a reference to the segment mapping, so the window stays valid for as long as the
/// page is alive even if the storage is dropped.
#[derive(Clone)]
pub struct MappedPage {
    backing: Backing,
    range: Range<usize>,
    endian: Endian,
}

impl MappedPage {
    /// Window onto `len` bytes of a segment mapping starting at `offset`.
    pub(crate) fn mapped(map: Arc<Mmap>, offset: usize, len: usize, endian: Endian) -> Result<Self> {
        let range = checked_range(offset, len, map.len())?;
        Ok(Self { backing: Backing::Mapped(map), range, endian })
    }

    /// Window over a shared heap copy.
    pub(crate) fn heap(bytes: Arc<[u8]>, endian: Endian) -> Self {
        let range = 0..bytes.len();
        Self { backing: Backing::Heap(bytes), range, endian }
    }

    /// Copies the window into an owned buffer.
    pub fn to_page_buffer(&self) -> PageBuffer {
        PageBuffer::from_vec(self.as_bytes().to_vec(), self.endian)
    }
}

impl PageRead for MappedPage {
    fn as_bytes(&self) -> &[u8] {
        &self.backing.bytes()[self.range.clone()]
    }

    fn endian(&self) -> Endian {
        self.endian
    }
}

impl fmt::Debug for MappedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.backing {
            Backing::Mapped(_) => "mapped",
            Backing::Heap(_) => "heap",
        };
        f.debug_struct("MappedPage")
            .field("backing", &kind)
            .field("range", &self.range)
            .field("endian", &self.endian)
            .finish()
    }
}

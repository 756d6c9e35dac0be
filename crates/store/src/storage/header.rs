//! Storage header layout.
//!
//! Every storage owns a small header file with three fixed regions:
//!
//! | Offset | Size | Content                  |
//! |--------|------|--------------------------|
//! | 0      | 64   | Static header            |
//! | 64     | 64   | Dynamic header, slot 0   |
//! | 128    | 64   | Dynamic header, slot 1   |
//!
//! The static header is written once at creation. The dynamic header is rewritten on
//! every flush, alternating between the two slots by append version (`version % 2`), so a
//! torn write can damage at most one copy. On open both slots are validated and the valid
//! copy with the higher append version wins.
//!
//! ## Static header
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 8    | Magic `ARBORSTR` |
//! | 8      | 1    | Byte order       |
//! | 9      | 4    | Format version   |
//! | 13     | 4    | Page size        |
//! | 17     | 4    | Page log size    |
//! | 21     | 8    | Segment size     |
//! | 29     | 4    | Checksum type id |
//!
//! ## Dynamic header
//!
//! | Offset | Size | Field                         |
//! |--------|------|-------------------------------|
//! | 0      | 8    | Append version                |
//! | 8      | 8    | Global append offset          |
//! | 16     | 8    | Current segment append offset |
//! | 24     | 4    | Checksum length               |
//! | 28     | n    | Checksum over bytes 0..28     |

use tracing::warn;

use crate::{
    buffer::{Endian, PageBuffer, PageRead},
    checksum::ChecksumType,
    config::StoreConfig,
    error::{Error, Result},
};

/// Magic bytes at the start of every header file.
pub const MAGIC: [u8; 8] = *b"ARBORSTR";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the static header region.
pub const STATIC_HEADER_SIZE: usize = 64;

/// Size of one dynamic header slot.
pub const DYNAMIC_HEADER_SIZE: usize = 64;

/// Total size of a header file.
pub const HEADER_FILE_SIZE: usize = STATIC_HEADER_SIZE + 2 * DYNAMIC_HEADER_SIZE;

const DYNAMIC_BODY_SIZE: usize = 28;

/// Immutable storage parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticHeader {
    /// Byte order of every integer in this storage.
    pub endian: Endian,
    /// Format version the storage was written with.
    pub format_version: u32,
    /// Page size in bytes.
    pub page_size: u32,
    /// Bytes reserved for the leaf log in each node page.
    pub page_log_size: u32,
    /// Segment file size in bytes.
    pub segment_size: u64,
    /// Checksum algorithm for headers and payloads.
    pub checksum: ChecksumType,
}

impl StaticHeader {
    /// Static header for a storage created from `config`.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            endian: config.endian,
            format_version: FORMAT_VERSION,
            page_size: config.page_size as u32,
            page_log_size: config.page_log_size() as u32,
            segment_size: config.segment_size,
            checksum: config.checksum,
        }
    }

    /// Same parameters with a different segment size.
    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Serializes the header into its 64-byte region.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = PageBuffer::new(STATIC_HEADER_SIZE, self.endian);
        buf.put_bytes(0, &MAGIC)?;
        buf.put_u8(8, self.endian.to_byte())?;
        buf.put_u32(9, self.format_version)?;
        buf.put_u32(13, self.page_size)?;
        buf.put_u32(17, self.page_log_size)?;
        buf.put_u64(21, self.segment_size)?;
        buf.put_u32(29, self.checksum.id())?;
        Ok(buf.into_vec())
    }

    /// Parses and validates a static header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMagic`] if the magic bytes differ.
    /// Returns [`Error::UnsupportedVersion`] for a newer format version.
    /// Returns [`Error::UnknownChecksumType`] for an unknown algorithm id.
    /// Returns [`Error::Corrupted`] for an impossible page or segment size.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STATIC_HEADER_SIZE {
            return Err(Error::Corrupted {
                reason: format!("static header too short: {} bytes", bytes.len()),
            });
        }
        if bytes[..8] != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let endian = Endian::from_byte(bytes[8])?;
        let buf = PageBuffer::from_vec(bytes[..STATIC_HEADER_SIZE].to_vec(), endian);

        let format_version = buf.get_u32(9)?;
        if format_version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion { version: format_version });
        }
        let page_size = buf.get_u32(13)?;
        let page_log_size = buf.get_u32(17)?;
        let segment_size = buf.get_u64(21)?;
        let checksum = ChecksumType::from_id(buf.get_u32(29)?)?;

        if !page_size.is_power_of_two() || page_log_size >= page_size || segment_size == 0 {
            return Err(Error::Corrupted {
                reason: format!(
                    "invalid static header geometry: page {page_size}, log {page_log_size}, segment {segment_size}"
                ),
            });
        }

        Ok(Self { endian, format_version, page_size, page_log_size, segment_size, checksum })
    }
}

/// Mutable append position, persisted on every flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DynamicHeader {
    /// Incremented on every header write.
    pub append_version: u64,
    /// Global byte offset of the next append.
    pub global_offset: u64,
    /// Offset of the next append inside the current segment.
    pub local_offset: u64,
}

impl DynamicHeader {
    /// Slot this header is written to.
    pub fn slot(&self) -> usize {
        (self.append_version % 2) as usize
    }

    /// Byte offset of a slot inside the header file.
    pub fn slot_offset(slot: usize) -> u64 {
        (STATIC_HEADER_SIZE + slot * DYNAMIC_HEADER_SIZE) as u64
    }

    /// Header for the next flush at the given append position.
    pub fn next(&self, global_offset: u64, local_offset: u64) -> Self {
        Self { append_version: self.append_version + 1, global_offset, local_offset }
    }

    /// Serializes the header with its trailing checksum.
    pub fn to_bytes(&self, endian: Endian, checksum: ChecksumType) -> Result<Vec<u8>> {
        let mut buf = PageBuffer::new(DYNAMIC_HEADER_SIZE, endian);
        buf.put_u64(0, self.append_version)?;
        buf.put_u64(8, self.global_offset)?;
        buf.put_u64(16, self.local_offset)?;
        buf.put_u32(24, checksum.value_size() as u32)?;
        let value = checksum.compute(&[&buf.as_bytes()[..DYNAMIC_BODY_SIZE]]);
        buf.put_bytes(DYNAMIC_BODY_SIZE, &value)?;
        Ok(buf.into_vec())
    }

    /// Parses a slot, verifying its checksum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HeaderChecksumMismatch`] if the stored checksum is missing, has the
    /// wrong length, or does not match the body.
    pub fn from_bytes(bytes: &[u8], endian: Endian, checksum: ChecksumType) -> Result<Self> {
        if bytes.len() < DYNAMIC_HEADER_SIZE {
            return Err(Error::HeaderChecksumMismatch);
        }
        let buf = PageBuffer::from_vec(bytes[..DYNAMIC_HEADER_SIZE].to_vec(), endian);
        let len = buf.get_u32(24)? as usize;
        if len != checksum.value_size() || DYNAMIC_BODY_SIZE + len > DYNAMIC_HEADER_SIZE {
            return Err(Error::HeaderChecksumMismatch);
        }
        let mut state = checksum.create();
        state.update(&buf.as_bytes()[..DYNAMIC_BODY_SIZE]);
        if !state.compare(buf.get_bytes(DYNAMIC_BODY_SIZE, len)?) {
            return Err(Error::HeaderChecksumMismatch);
        }
        Ok(Self {
            append_version: buf.get_u64(0)?,
            global_offset: buf.get_u64(8)?,
            local_offset: buf.get_u64(16)?,
        })
    }

    /// Picks the authoritative header from both slots.
    ///
    /// The valid slot with the higher append version wins. A single valid slot wins
    /// unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HeaderChecksumMismatch`] if neither slot is valid.
    pub fn choose(
        slot0: &[u8],
        slot1: &[u8],
        endian: Endian,
        checksum: ChecksumType,
    ) -> Result<Self> {
        let first = Self::from_bytes(slot0, endian, checksum);
        let second = Self::from_bytes(slot1, endian, checksum);
        match (first, second) {
            (Ok(a), Ok(b)) => Ok(if b.append_version > a.append_version { b } else { a }),
            (Ok(a), Err(_)) => {
                warn!(append_version = a.append_version, "Dynamic header slot 1 invalid, using slot 0");
                Ok(a)
            },
            (Err(_), Ok(b)) => {
                warn!(append_version = b.append_version, "Dynamic header slot 0 invalid, using slot 1");
                Ok(b)
            },
            (Err(_), Err(_)) => Err(Error::HeaderChecksumMismatch),
        }
    }
}

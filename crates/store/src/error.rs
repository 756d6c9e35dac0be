//! Error types for the arbor storage engine.

use std::io;

use snafu::Snafu;

/// Global page number: byte offset of the page divided by the page size.
pub type PageNumber = u64;

/// Result type alias for arbor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during arbor operations.
///
/// Key or version absence is never reported through this type; lookups
/// return `Ok(None)` instead.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// I/O error from the underlying storage.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Storage file is corrupted or has an invalid layout.
    #[snafu(display("Corrupted storage: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// Static header does not start with the arbor magic bytes.
    #[snafu(display("Invalid storage magic number"))]
    InvalidMagic,

    /// Static header carries a format version this build cannot read.
    #[snafu(display("Unsupported format version: {version}"))]
    UnsupportedVersion {
        /// The unsupported version number.
        version: u32,
    },

    /// Neither dynamic header slot passed checksum validation.
    #[snafu(display("Header checksum mismatch"))]
    HeaderChecksumMismatch,

    /// A node page failed checksum verification.
    #[snafu(display("Page {page} checksum mismatch"))]
    PageChecksumMismatch {
        /// The page whose checksum failed.
        page: PageNumber,
    },

    /// Checksum algorithm id not known to this build.
    #[snafu(display("Unknown checksum type: {id}"))]
    UnknownChecksumType {
        /// The id read from the static header.
        id: u32,
    },

    /// Node page carries an unrecognized kind tag.
    #[snafu(display("Unknown node kind tag: {tag}"))]
    UnknownNodeKind {
        /// The tag byte.
        tag: u8,
    },

    /// A value log record failed checksum verification.
    #[snafu(display("Value record at offset {offset} checksum mismatch"))]
    ValueChecksumMismatch {
        /// Offset of the record in the value log.
        offset: u64,
    },

    /// Access beyond the bounds of a page buffer.
    #[snafu(display("Page access out of bounds: offset {offset} + {len} > {size}"))]
    PageOverflow {
        /// Start of the access.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// Size of the buffer.
        size: usize,
    },

    /// Record larger than a single segment can hold.
    #[snafu(display("Record too large: {size} bytes (max {max})"))]
    RecordTooLarge {
        /// Size of the rejected record.
        size: usize,
        /// Maximum size a segment accepts.
        max: usize,
    },

    /// Read past the durable append offset of a storage.
    #[snafu(display("Offset out of range: {offset} + {len} > {limit}"))]
    OffsetOutOfRange {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Current append offset.
        limit: u64,
    },

    /// Global offset space exhausted.
    #[snafu(display("Storage address space exhausted"))]
    OutOfSpace,

    /// Configuration rejected by validation.
    #[snafu(display("Invalid configuration: {reason}"))]
    InvalidConfig {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// Another writer installed a root between traversal and install.
    #[snafu(display("Concurrent modification: root changed while installing version {version}"))]
    ConcurrentModification {
        /// The version that could not be installed.
        version: u64,
    },

    /// The async index writer is no longer accepting commands.
    #[snafu(display("Index writer is closed"))]
    WriterClosed,

    /// A batch commit in the async index writer failed.
    #[snafu(display("Batch commit failed: {reason}"))]
    CommitFailed {
        /// Rendered error of the failed commit.
        reason: String,
    },
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

impl Error {
    /// Returns true for errors that indicate on-disk corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corrupted { .. }
                | Error::InvalidMagic
                | Error::UnsupportedVersion { .. }
                | Error::HeaderChecksumMismatch
                | Error::PageChecksumMismatch { .. }
                | Error::UnknownChecksumType { .. }
                | Error::UnknownNodeKind { .. }
                | Error::ValueChecksumMismatch { .. }
        )
    }
}

//! File-backed storage: one header file plus pre-sized, memory-mapped segment files.
//!
//! Writes go through position-based I/O (`pwrite`) on the segment file handle and are
//! serialized by a [`parking_lot::Mutex`] around the append state. Reads never take that
//! lock: they check the range against an atomically published append limit and return a
//! window onto the segment's shared read-only mapping, which observes the written bytes
//! through the page cache.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::{
    AppendCursor, DynamicHeader, StaticHeader, StorageBackend,
    header::{HEADER_FILE_SIZE, STATIC_HEADER_SIZE},
    header_file_name, locate, segment_file_name,
};
use crate::{
    buffer::MappedPage,
    error::{Error, Result},
};

struct Segment {
    file: File,
    map: Arc<Mmap>,
}

struct AppendState {
    cursor: AppendCursor,
    header: DynamicHeader,
    /// First segment that may hold data not yet synced.
    unsynced_from: u64,
}

/// Segmented append-only storage on the local filesystem.
///
/// Files live in one directory: `<name>.header` and `<name>.000000`, `<name>.000001`, ...
/// Segment mappings are created once and kept until the storage is dropped.
pub struct FileStorage {
    dir: PathBuf,
    name: String,
    header_file: File,
    static_header: StaticHeader,
    segments: RwLock<Vec<Segment>>,
    state: Mutex<AppendState>,
    /// Global offset below which bytes are readable.
    limit: AtomicU64,
}

impl FileStorage {
    /// Creates a new storage, replacing any existing files with the same name.
    ///
    /// Writes the static header and an empty dynamic header (append version 0) to slot 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory or header file cannot be created.
    pub fn create(dir: impl AsRef<Path>, name: &str, static_header: StaticHeader) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(header_file_name(name));
        let header_file =
            OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;

        let dynamic = DynamicHeader::default();
        let mut bytes = vec![0u8; HEADER_FILE_SIZE];
        bytes[..STATIC_HEADER_SIZE].copy_from_slice(&static_header.to_bytes()?);
        let slot = DynamicHeader::slot_offset(dynamic.slot()) as usize;
        let encoded = dynamic.to_bytes(static_header.endian, static_header.checksum)?;
        bytes[slot..slot + encoded.len()].copy_from_slice(&encoded);
        write_all_at_offset(&header_file, &bytes, 0)?;
        header_file.sync_all()?;

        info!(
            path = %path.display(),
            page_size = static_header.page_size,
            segment_size = static_header.segment_size,
            checksum = %static_header.checksum,
            "Created storage"
        );

        Ok(Self::assemble(dir, name, header_file, static_header, dynamic, Vec::new()))
    }

    /// Opens an existing storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a file cannot be opened or read.
    /// Returns [`Error::InvalidMagic`] or [`Error::UnsupportedVersion`] for a foreign or
    /// newer header file.
    /// Returns [`Error::HeaderChecksumMismatch`] if both dynamic header slots are invalid.
    /// Returns [`Error::Corrupted`] if a segment below the append offset is missing.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(header_file_name(name));
        let header_file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut bytes = vec![0u8; HEADER_FILE_SIZE];
        read_exact_at_offset(&header_file, &mut bytes, 0)?;
        let static_header = StaticHeader::from_bytes(&bytes)?;
        let slot0 = DynamicHeader::slot_offset(0) as usize;
        let slot1 = DynamicHeader::slot_offset(1) as usize;
        let dynamic = DynamicHeader::choose(
            &bytes[slot0..slot1],
            &bytes[slot1..],
            static_header.endian,
            static_header.checksum,
        )?;
        if dynamic.local_offset > static_header.segment_size {
            return Err(Error::Corrupted {
                reason: format!(
                    "segment offset {} exceeds segment size {}",
                    dynamic.local_offset, static_header.segment_size
                ),
            });
        }

        let cursor = AppendCursor::new(&dynamic, static_header.segment_size);
        let mut segments = Vec::new();
        for index in 0..cursor.segment_count() {
            let segment_path = dir.join(segment_file_name(name, index));
            if !segment_path.exists() {
                return Err(Error::Corrupted {
                    reason: format!("missing segment {}", segment_path.display()),
                });
            }
            segments.push(open_segment(&segment_path, static_header.segment_size)?);
        }

        info!(
            path = %path.display(),
            page_size = static_header.page_size,
            segment_size = static_header.segment_size,
            append_offset = dynamic.global_offset,
            append_version = dynamic.append_version,
            "Opened storage"
        );

        Ok(Self::assemble(dir, name, header_file, static_header, dynamic, segments))
    }

    /// Opens the storage if its header file exists, otherwise creates it.
    ///
    /// An existing storage keeps the parameters it was created with.
    pub fn open_or_create(
        dir: impl AsRef<Path>,
        name: &str,
        static_header: StaticHeader,
    ) -> Result<Self> {
        if dir.as_ref().join(header_file_name(name)).exists() {
            Self::open(dir, name)
        } else {
            Self::create(dir, name, static_header)
        }
    }

    fn assemble(
        dir: PathBuf,
        name: &str,
        header_file: File,
        static_header: StaticHeader,
        dynamic: DynamicHeader,
        segments: Vec<Segment>,
    ) -> Self {
        let cursor = AppendCursor::new(&dynamic, static_header.segment_size);
        let unsynced_from = segments.len().saturating_sub(1) as u64;
        Self {
            dir,
            name: name.to_string(),
            header_file,
            static_header,
            segments: RwLock::new(segments),
            state: Mutex::new(AppendState { cursor, header: dynamic, unsynced_from }),
            limit: AtomicU64::new(cursor.global()),
        }
    }

    /// Path of the header file.
    pub fn header_path(&self) -> PathBuf {
        self.dir.join(header_file_name(&self.name))
    }

    /// Path of a segment file.
    pub fn segment_path(&self, index: u64) -> PathBuf {
        self.dir.join(segment_file_name(&self.name, index))
    }

    /// Number of segment files currently mapped.
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    fn ensure_segment(&self, index: u64) -> Result<()> {
        let mut segments = self.segments.write();
        while (segments.len() as u64) <= index {
            let next = segments.len() as u64;
            let segment = open_segment(&self.segment_path(next), self.static_header.segment_size)?;
            debug!(storage = %self.name, segment = next, "Rolled to new segment");
            segments.push(segment);
        }
        Ok(())
    }
}

fn open_segment(path: &Path, segment_size: u64) -> Result<Segment> {
    let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
    if file.metadata()?.len() < segment_size {
        file.set_len(segment_size)?;
    }
    // SAFETY: segment files are private to this storage and only ever written through
    // `append`, which targets bytes past the published read limit. Mapped windows handed to
    // readers cover bytes below that limit, which are never rewritten while mapped.
    #[allow(unsafe_code)]
    let map = unsafe { Mmap::map(&file)? };
    Ok(Segment { file, map: Arc::new(map) })
}

impl StorageBackend for FileStorage {
    fn static_header(&self) -> StaticHeader {
        self.static_header
    }

    fn dynamic_header(&self) -> DynamicHeader {
        self.state.lock().header
    }

    fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut state = self.state.lock();
        let mut cursor = state.cursor;
        let reservation = cursor.reserve(bytes.len())?;
        if !bytes.is_empty() {
            self.ensure_segment(reservation.segment)?;
            let segments = self.segments.read();
            let segment = segments.get(reservation.segment as usize).ok_or_else(|| {
                Error::Corrupted { reason: format!("segment {} not mapped", reservation.segment) }
            })?;
            write_all_at_offset(&segment.file, bytes, reservation.local)?;
        }
        state.cursor = cursor;
        self.limit.store(cursor.global(), Ordering::Release);
        Ok(reservation.offset)
    }

    fn map(&self, offset: u64, len: usize) -> Result<MappedPage> {
        let limit = self.limit.load(Ordering::Acquire);
        let (segment, local) = locate(offset, len, limit, self.static_header.segment_size)?;
        let segments = self.segments.read();
        let segment = segments.get(segment as usize).ok_or_else(|| Error::Corrupted {
            reason: format!("segment {segment} not mapped"),
        })?;
        MappedPage::mapped(Arc::clone(&segment.map), local, len, self.static_header.endian)
    }

    fn flush(&self, sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        let cursor = state.cursor;
        if sync {
            let segments = self.segments.read();
            for segment in segments.iter().skip(state.unsynced_from as usize) {
                segment.file.sync_data()?;
            }
            state.unsynced_from = segments.len().saturating_sub(1) as u64;
        }
        if cursor.global() == state.header.global_offset && cursor.local() == state.header.local_offset
        {
            return Ok(());
        }

        let next = state.header.next(cursor.global(), cursor.local());
        let bytes = next.to_bytes(self.static_header.endian, self.static_header.checksum)?;
        write_all_at_offset(&self.header_file, &bytes, DynamicHeader::slot_offset(next.slot()))?;
        if sync {
            self.header_file.sync_data()?;
        }
        debug!(
            storage = %self.name,
            slot = next.slot(),
            append_version = next.append_version,
            append_offset = next.global_offset,
            "Wrote dynamic header"
        );
        state.header = next;
        Ok(())
    }

    fn append_offset(&self) -> u64 {
        self.limit.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of file during seek_read",
            )
            .into());
        }
        pos += n;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}

//! On-disk damage for recovery tests.
//!
//! Storage files are opened, patched in place and synced, so a store reopened afterwards
//! sees exactly the damaged bytes.

// Test utilities are expected to panic on failure - that's their purpose
#![allow(clippy::expect_used)]

use std::{
    fs::OpenOptions,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

/// Reads `len` bytes at `offset`.
///
/// # Panics
///
/// Panics if the file cannot be read.
#[must_use]
pub fn read_bytes(path: &Path, offset: u64, len: usize) -> Vec<u8> {
    let mut file = OpenOptions::new().read(true).open(path).expect("open file for reading");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    let mut bytes = vec![0u8; len];
    file.read_exact(&mut bytes).expect("read bytes");
    bytes
}

/// Overwrites the bytes at `offset`.
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn write_bytes(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).expect("open file");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(bytes).expect("write bytes");
    file.sync_all().expect("sync");
}

/// Inverts every bit of the byte at `offset`.
///
/// # Panics
///
/// Panics if the file cannot be read or written.
pub fn flip_byte(path: &Path, offset: u64) {
    let byte = read_bytes(path, offset, 1)[0];
    write_bytes(path, offset, &[!byte]);
}

/// Zeroes `len` bytes at `offset`, as left behind by a write that never reached the disk.
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn zero_range(path: &Path, offset: u64, len: usize) {
    write_bytes(path, offset, &vec![0u8; len]);
}

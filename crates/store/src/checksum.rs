//! Pluggable checksum algorithms.
//!
//! The algorithm is chosen once when a storage is created and its id is recorded in the
//! static header, so a reader always verifies with the algorithm the writer used.
//! Checksum values are serialized big-endian regardless of the storage byte order.

use std::fmt;

use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::Xxh3;

use crate::error::{Error, Result};

/// Largest checksum value any algorithm produces (SHA-256).
pub const MAX_CHECKSUM_SIZE: usize = 32;

/// Streaming checksum computation.
pub trait Checksum: Send {
    /// Feeds bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);

    /// Current checksum value, big-endian.
    fn value(&self) -> Vec<u8>;

    /// Restores the initial state.
    fn reset(&mut self);

    /// Size of [`Checksum::value`] in bytes.
    fn value_size(&self) -> usize;

    /// Compares the current value against a stored one.
    fn compare(&self, expected: &[u8]) -> bool {
        self.value() == expected
    }
}

/// Checksum algorithm identifier recorded in the static header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum ChecksumType {
    /// CRC-32 (IEEE).
    #[default]
    Crc32 = 1,
    /// Fletcher-32 over little-endian 16-bit words.
    Fletcher32 = 2,
    /// Fletcher-64 over little-endian 32-bit words.
    Fletcher64 = 3,
    /// SHA-256.
    Sha256 = 4,
    /// XXH3 64-bit.
    Xxh3 = 5,
}

impl ChecksumType {
    /// Header id of this algorithm.
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Resolves a header id.
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            1 => Ok(ChecksumType::Crc32),
            2 => Ok(ChecksumType::Fletcher32),
            3 => Ok(ChecksumType::Fletcher64),
            4 => Ok(ChecksumType::Sha256),
            5 => Ok(ChecksumType::Xxh3),
            id => Err(Error::UnknownChecksumType { id }),
        }
    }

    /// Size of a checksum value in bytes.
    pub fn value_size(self) -> usize {
        match self {
            ChecksumType::Crc32 | ChecksumType::Fletcher32 => 4,
            ChecksumType::Fletcher64 | ChecksumType::Xxh3 => 8,
            ChecksumType::Sha256 => 32,
        }
    }

    /// Creates a fresh checksum state.
    pub fn create(self) -> Box<dyn Checksum> {
        match self {
            ChecksumType::Crc32 => Box::new(Crc32::default()),
            ChecksumType::Fletcher32 => Box::new(Fletcher32::default()),
            ChecksumType::Fletcher64 => Box::new(Fletcher64::default()),
            ChecksumType::Sha256 => Box::new(Sha256Checksum::default()),
            ChecksumType::Xxh3 => Box::new(Xxh3Checksum::default()),
        }
    }

    /// One-shot checksum over a sequence of byte ranges.
    pub fn compute(self, parts: &[&[u8]]) -> Vec<u8> {
        let mut checksum = self.create();
        for part in parts {
            checksum.update(part);
        }
        checksum.value()
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChecksumType::Crc32 => "crc32",
            ChecksumType::Fletcher32 => "fletcher32",
            ChecksumType::Fletcher64 => "fletcher64",
            ChecksumType::Sha256 => "sha256",
            ChecksumType::Xxh3 => "xxh3",
        };
        f.write_str(name)
    }
}

/// CRC-32 backed by `crc32fast`.
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Checksum for Crc32 {
    fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn value(&self) -> Vec<u8> {
        self.hasher.clone().finalize().to_be_bytes().to_vec()
    }

    fn reset(&mut self) {
        self.hasher = crc32fast::Hasher::new();
    }

    fn value_size(&self) -> usize {
        4
    }
}

/// Fletcher-32. A trailing odd byte is zero-padded into a final word.
#[derive(Clone, Default)]
pub struct Fletcher32 {
    sum1: u32,
    sum2: u32,
    pending: Option<u8>,
}

impl Fletcher32 {
    const MODULUS: u32 = 0xFFFF;

    fn add_word(sum1: &mut u32, sum2: &mut u32, word: u16) {
        *sum1 = (*sum1 + u32::from(word)) % Self::MODULUS;
        *sum2 = (*sum2 + *sum1) % Self::MODULUS;
    }
}

impl Checksum for Fletcher32 {
    fn update(&mut self, mut bytes: &[u8]) {
        if let Some(low) = self.pending.take() {
            match bytes.split_first() {
                Some((&high, rest)) => {
                    Self::add_word(&mut self.sum1, &mut self.sum2, u16::from_le_bytes([low, high]));
                    bytes = rest;
                },
                None => {
                    self.pending = Some(low);
                    return;
                },
            }
        }
        let mut words = bytes.chunks_exact(2);
        for word in &mut words {
            Self::add_word(&mut self.sum1, &mut self.sum2, u16::from_le_bytes([word[0], word[1]]));
        }
        self.pending = words.remainder().first().copied();
    }

    fn value(&self) -> Vec<u8> {
        let (mut sum1, mut sum2) = (self.sum1, self.sum2);
        if let Some(low) = self.pending {
            Self::add_word(&mut sum1, &mut sum2, u16::from(low));
        }
        ((sum2 << 16) | sum1).to_be_bytes().to_vec()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn value_size(&self) -> usize {
        4
    }
}

/// Fletcher-64. A trailing partial word is zero-padded.
#[derive(Clone, Default)]
pub struct Fletcher64 {
    sum1: u64,
    sum2: u64,
    pending: Vec<u8>,
}

impl Fletcher64 {
    const MODULUS: u64 = 0xFFFF_FFFF;

    fn add_word(sum1: &mut u64, sum2: &mut u64, word: u32) {
        *sum1 = (*sum1 + u64::from(word)) % Self::MODULUS;
        *sum2 = (*sum2 + *sum1) % Self::MODULUS;
    }

    fn word(bytes: &[u8]) -> u32 {
        let mut word = [0u8; 4];
        word[..bytes.len()].copy_from_slice(bytes);
        u32::from_le_bytes(word)
    }
}

impl Checksum for Fletcher64 {
    fn update(&mut self, mut bytes: &[u8]) {
        if !self.pending.is_empty() {
            let take = (4 - self.pending.len()).min(bytes.len());
            self.pending.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.pending.len() < 4 {
                return;
            }
            let word = Self::word(&self.pending);
            Self::add_word(&mut self.sum1, &mut self.sum2, word);
            self.pending.clear();
        }
        let mut words = bytes.chunks_exact(4);
        for word in &mut words {
            Self::add_word(&mut self.sum1, &mut self.sum2, Self::word(word));
        }
        self.pending.extend_from_slice(words.remainder());
    }

    fn value(&self) -> Vec<u8> {
        let (mut sum1, mut sum2) = (self.sum1, self.sum2);
        if !self.pending.is_empty() {
            Self::add_word(&mut sum1, &mut sum2, Self::word(&self.pending));
        }
        ((sum2 << 32) | sum1).to_be_bytes().to_vec()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn value_size(&self) -> usize {
        8
    }
}

/// SHA-256 backed by `sha2`.
#[derive(Clone, Default)]
pub struct Sha256Checksum {
    hasher: Sha256,
}

impl Checksum for Sha256Checksum {
    fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn value(&self) -> Vec<u8> {
        self.hasher.clone().finalize().to_vec()
    }

    fn reset(&mut self) {
        self.hasher = Sha256::new();
    }

    fn value_size(&self) -> usize {
        32
    }
}

/// XXH3-64 backed by `xxhash-rust`.
pub struct Xxh3Checksum {
    hasher: Xxh3,
}

impl Default for Xxh3Checksum {
    fn default() -> Self {
        Self { hasher: Xxh3::new() }
    }
}

impl Checksum for Xxh3Checksum {
    fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn value(&self) -> Vec<u8> {
        self.hasher.digest().to_be_bytes().to_vec()
    }

    fn reset(&mut self) {
        self.hasher.reset();
    }

    fn value_size(&self) -> usize {
        8
    }
}

//! Node page encoding.
//!
//! Every node occupies exactly one page:
//!
//! ```text
//! Offset  Size  Field
//! 0       1     kind tag (1 = leaf, 2 = internal)
//! 1       1     is_root flag
//! 2       2     key count
//! 4       2     log entry count (leaf only)
//! 6       2     checksum length
//! 8       8     previous root page (u64::MAX = none)
//! 16      8     version
//! 24      8     timestamp (ms since Unix epoch)
//! 32      32    checksum over bytes 0..32 and 64..page_size
//! 64      ..    leaf:     keys[n], values[n]
//!               internal: keys[n], children[n + 1]
//! P - L   L     leaf log region: 17-byte entries (key, value, op)
//! ```
//!
//! `P` is the page size and `L` the page log size recorded in the static header. Integers
//! use the storage byte order.

use crate::{
    buffer::{Endian, PageBuffer, PageRead},
    checksum::{ChecksumType, MAX_CHECKSUM_SIZE},
    error::{Error, PageNumber, Result},
    storage::StaticHeader,
};

use super::node::{InternalNode, LeafNode, LogEntry, LogOp, Node, NodeBody, NodeHeader, NodeRef};

/// Size of the fixed node header.
pub const NODE_HEADER_SIZE: usize = 64;

/// Size of one leaf log entry.
pub const LOG_ENTRY_SIZE: usize = 17;

const KIND_LEAF: u8 = 1;
const KIND_INTERNAL: u8 = 2;
const NO_PAGE: u64 = u64::MAX;

const KIND_OFFSET: usize = 0;
const IS_ROOT_OFFSET: usize = 1;
const KEY_COUNT_OFFSET: usize = 2;
const LOG_COUNT_OFFSET: usize = 4;
const CHECKSUM_LEN_OFFSET: usize = 6;
const PREVIOUS_ROOT_OFFSET: usize = 8;
const VERSION_OFFSET: usize = 16;
const TIMESTAMP_OFFSET: usize = 24;
const CHECKSUM_OFFSET: usize = 32;
const CHECKSUMMED_HEADER: usize = 32;

/// Geometry and encoding parameters of node pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    /// Page size in bytes.
    pub page_size: usize,
    /// Bytes reserved for the leaf log.
    pub log_size: usize,
    /// Integer byte order.
    pub endian: Endian,
    /// Page checksum algorithm.
    pub checksum: ChecksumType,
}

impl PageLayout {
    /// Layout recorded in a storage's static header.
    pub fn from_header(header: &StaticHeader) -> Self {
        Self {
            page_size: header.page_size as usize,
            log_size: header.page_log_size as usize,
            endian: header.endian,
            checksum: header.checksum,
        }
    }

    /// Maximum log entries per leaf.
    pub fn log_capacity(&self) -> usize {
        self.log_size / LOG_ENTRY_SIZE
    }

    fn log_offset(&self) -> usize {
        self.page_size - self.log_size
    }

    fn leaf_fits(&self, keys: usize) -> bool {
        NODE_HEADER_SIZE + keys * 16 <= self.log_offset()
    }

    fn internal_fits(&self, keys: usize) -> bool {
        NODE_HEADER_SIZE + keys * 16 + 8 <= self.page_size
    }

    fn checksum_of(&self, page: &[u8]) -> Vec<u8> {
        self.checksum.compute(&[&page[..CHECKSUMMED_HEADER], &page[NODE_HEADER_SIZE..]])
    }
}

/// Encodes a node into a fresh page.
///
/// `children` holds the page numbers of an internal node's children, in order; it is
/// ignored for leaves.
///
/// # Errors
///
/// Returns [`Error::PageOverflow`] if the node does not fit the page.
pub fn encode(node: &Node, children: &[PageNumber], layout: &PageLayout) -> Result<PageBuffer> {
    let mut page = PageBuffer::new(layout.page_size, layout.endian);
    let header = &node.header;
    page.put_u8(IS_ROOT_OFFSET, u8::from(header.is_root))?;
    page.put_u64(PREVIOUS_ROOT_OFFSET, header.previous_root.unwrap_or(NO_PAGE))?;
    page.put_u64(VERSION_OFFSET, header.version)?;
    page.put_u64(TIMESTAMP_OFFSET, header.timestamp)?;

    match &node.body {
        NodeBody::Leaf(leaf) => {
            let n = leaf.keys.len();
            if !layout.leaf_fits(n) || leaf.log.len() > layout.log_capacity() {
                return Err(overflow(n, layout));
            }
            page.put_u8(KIND_OFFSET, KIND_LEAF)?;
            page.put_u16(KEY_COUNT_OFFSET, n as u16)?;
            page.put_u16(LOG_COUNT_OFFSET, leaf.log.len() as u16)?;
            let values_offset = NODE_HEADER_SIZE + n * 8;
            for (i, (&key, &value)) in leaf.keys.iter().zip(&leaf.values).enumerate() {
                page.put_u64(NODE_HEADER_SIZE + i * 8, key)?;
                page.put_u64(values_offset + i * 8, value)?;
            }
            let mut offset = layout.log_offset();
            for entry in &leaf.log {
                page.put_u64(offset, entry.key)?;
                page.put_u64(offset + 8, entry.value)?;
                page.put_u8(offset + 16, entry.op as u8)?;
                offset += LOG_ENTRY_SIZE;
            }
        },
        NodeBody::Internal(internal) => {
            let n = internal.keys.len();
            debug_assert_eq!(children.len(), n + 1, "internal node child count");
            if !layout.internal_fits(n) {
                return Err(overflow(n, layout));
            }
            page.put_u8(KIND_OFFSET, KIND_INTERNAL)?;
            page.put_u16(KEY_COUNT_OFFSET, n as u16)?;
            for (i, &key) in internal.keys.iter().enumerate() {
                page.put_u64(NODE_HEADER_SIZE + i * 8, key)?;
            }
            let children_offset = NODE_HEADER_SIZE + n * 8;
            for (i, &child) in children.iter().enumerate() {
                page.put_u64(children_offset + i * 8, child)?;
            }
        },
    }

    let checksum = layout.checksum_of(page.as_bytes());
    page.put_u16(CHECKSUM_LEN_OFFSET, checksum.len() as u16)?;
    // The length field sits inside the checksummed header, so hash again with it in place.
    let checksum = layout.checksum_of(page.as_bytes());
    page.put_bytes(CHECKSUM_OFFSET, &checksum)?;
    Ok(page)
}

fn overflow(keys: usize, layout: &PageLayout) -> Error {
    Error::PageOverflow { offset: NODE_HEADER_SIZE, len: keys * 16, size: layout.page_size }
}

/// Decodes and verifies the node stored on `page_number`.
///
/// # Errors
///
/// Returns [`Error::PageChecksumMismatch`] if the page checksum does not match.
/// Returns [`Error::UnknownNodeKind`] for an unrecognized kind tag.
/// Returns [`Error::Corrupted`] if a count field does not fit the page.
pub fn decode<P: PageRead>(page: &P, page_number: PageNumber, layout: &PageLayout) -> Result<Node> {
    if page.len() != layout.page_size {
        return Err(Error::Corrupted {
            reason: format!("page {page_number} has {} bytes, expected {}", page.len(), layout.page_size),
        });
    }
    let checksum_len = page.get_u16(CHECKSUM_LEN_OFFSET)? as usize;
    if checksum_len != layout.checksum.value_size() || checksum_len > MAX_CHECKSUM_SIZE {
        return Err(Error::PageChecksumMismatch { page: page_number });
    }
    let stored = page.get_bytes(CHECKSUM_OFFSET, checksum_len)?;
    if layout.checksum_of(page.as_bytes()) != stored {
        return Err(Error::PageChecksumMismatch { page: page_number });
    }

    let previous_root = match page.get_u64(PREVIOUS_ROOT_OFFSET)? {
        NO_PAGE => None,
        page => Some(page),
    };
    let header = NodeHeader {
        is_root: page.get_u8(IS_ROOT_OFFSET)? != 0,
        previous_root,
        version: page.get_u64(VERSION_OFFSET)?,
        timestamp: page.get_u64(TIMESTAMP_OFFSET)?,
    };
    let n = page.get_u16(KEY_COUNT_OFFSET)? as usize;

    let body = match page.get_u8(KIND_OFFSET)? {
        KIND_LEAF => {
            let log_count = page.get_u16(LOG_COUNT_OFFSET)? as usize;
            if !layout.leaf_fits(n) || log_count > layout.log_capacity() {
                return Err(corrupt_counts(page_number, n, log_count));
            }
            let values_offset = NODE_HEADER_SIZE + n * 8;
            let mut leaf = LeafNode {
                keys: Vec::with_capacity(n),
                values: Vec::with_capacity(n),
                log: Vec::with_capacity(log_count),
            };
            for i in 0..n {
                leaf.keys.push(page.get_u64(NODE_HEADER_SIZE + i * 8)?);
                leaf.values.push(page.get_u64(values_offset + i * 8)?);
            }
            let mut offset = layout.log_offset();
            for _ in 0..log_count {
                let tag = page.get_u8(offset + 16)?;
                let op = LogOp::from_tag(tag).ok_or_else(|| Error::Corrupted {
                    reason: format!("page {page_number} has invalid log op {tag}"),
                })?;
                leaf.log.push(LogEntry {
                    key: page.get_u64(offset)?,
                    value: page.get_u64(offset + 8)?,
                    op,
                });
                offset += LOG_ENTRY_SIZE;
            }
            NodeBody::Leaf(leaf)
        },
        KIND_INTERNAL => {
            if !layout.internal_fits(n) {
                return Err(corrupt_counts(page_number, n, 0));
            }
            let children_offset = NODE_HEADER_SIZE + n * 8;
            let mut internal =
                InternalNode { keys: Vec::with_capacity(n), children: Vec::with_capacity(n + 1) };
            for i in 0..n {
                internal.keys.push(page.get_u64(NODE_HEADER_SIZE + i * 8)?);
            }
            for i in 0..=n {
                internal.children.push(NodeRef::Stored(page.get_u64(children_offset + i * 8)?));
            }
            NodeBody::Internal(internal)
        },
        tag => return Err(Error::UnknownNodeKind { tag }),
    };

    Ok(Node::stored(header, body, page_number))
}

fn corrupt_counts(page: PageNumber, keys: usize, log: usize) -> Error {
    Error::Corrupted { reason: format!("page {page} has impossible counts: {keys} keys, {log} log entries") }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn layout(endian: Endian, log_size: usize) -> PageLayout {
        PageLayout { page_size: 512, log_size, endian, checksum: ChecksumType::Crc32 }
    }

    fn sample_leaf() -> Node {
        let mut leaf = LeafNode::default();
        for key in [5u64, 1, 9, 3] {
            leaf.insert(key, key + 1000);
        }
        leaf.log.push(LogEntry { key: 7, value: 77, op: LogOp::Put });
        leaf.log.push(LogEntry { key: 1, value: 0, op: LogOp::Remove });
        let header = NodeHeader { is_root: true, previous_root: Some(12), version: 42, timestamp: 1234 };
        Node::new(header, NodeBody::Leaf(leaf))
    }

    fn sample_internal() -> Node {
        let internal = InternalNode {
            keys: vec![10, 20, 30],
            children: (0..4).map(NodeRef::Stored).collect(),
        };
        Node::new(NodeHeader::new(7, 99), NodeBody::Internal(internal))
    }

    #[test]
    fn test_leaf_roundtrip_both_orders() {
        for endian in [Endian::Little, Endian::Big] {
            let layout = layout(endian, 68);
            let node = sample_leaf();
            let page = encode(&node, &[], &layout).unwrap();
            let decoded = decode(&page, 3, &layout).unwrap();
            assert_eq!(decoded.header, node.header);
            assert_eq!(decoded.as_leaf(), node.as_leaf());
            assert_eq!(decoded.page(), Some(3));
        }
    }

    #[test]
    fn test_internal_roundtrip_both_orders() {
        for endian in [Endian::Little, Endian::Big] {
            let layout = layout(endian, 0);
            let node = sample_internal();
            let page = encode(&node, &[100, 101, 102, 103], &layout).unwrap();
            let decoded = decode(&page, 8, &layout).unwrap();
            assert_eq!(decoded.header, node.header);
            let internal = decoded.as_internal().unwrap();
            assert_eq!(internal.keys, vec![10, 20, 30]);
            let children: Vec<_> = internal.children.iter().filter_map(NodeRef::page).collect();
            assert_eq!(children, vec![100, 101, 102, 103]);
        }
    }

    #[test]
    fn test_header_layout() {
        let layout = layout(Endian::Big, 0);
        let page = encode(&sample_internal(), &[1, 2, 3, 4], &layout).unwrap();
        let bytes = page.as_bytes();
        assert_eq!(bytes[0], KIND_INTERNAL);
        assert_eq!(bytes[1], 0);
        assert_eq!(&bytes[2..4], &3u16.to_be_bytes());
        assert_eq!(&bytes[6..8], &4u16.to_be_bytes());
        assert_eq!(&bytes[8..16], &u64::MAX.to_be_bytes());
        assert_eq!(&bytes[16..24], &7u64.to_be_bytes());
        assert_eq!(&bytes[64..72], &10u64.to_be_bytes());
        assert_eq!(&bytes[88..96], &1u64.to_be_bytes());
    }

    #[test]
    fn test_corrupted_body_fails_checksum() {
        let layout = layout(Endian::Little, 68);
        let mut page = encode(&sample_leaf(), &[], &layout).unwrap();
        page.as_mut_bytes()[70] ^= 0x01;
        assert!(matches!(decode(&page, 5, &layout), Err(Error::PageChecksumMismatch { page: 5 })));
    }

    #[test]
    fn test_corrupted_header_fails_checksum() {
        let layout = layout(Endian::Little, 68);
        let mut page = encode(&sample_leaf(), &[], &layout).unwrap();
        page.as_mut_bytes()[VERSION_OFFSET] ^= 0x80;
        assert!(matches!(decode(&page, 5, &layout), Err(Error::PageChecksumMismatch { .. })));
    }

    #[test]
    fn test_zero_page_is_rejected() {
        let layout = layout(Endian::Little, 0);
        let page = PageBuffer::new(512, Endian::Little);
        assert!(matches!(decode(&page, 0, &layout), Err(Error::PageChecksumMismatch { page: 0 })));
    }

    #[test]
    fn test_unknown_kind_tag() {
        let layout = layout(Endian::Little, 0);
        let mut page = encode(&sample_internal(), &[1, 2, 3, 4], &layout).unwrap();
        page.put_u8(KIND_OFFSET, 9).unwrap();
        let checksum = layout.checksum_of(page.as_bytes());
        page.put_bytes(CHECKSUM_OFFSET, &checksum).unwrap();
        assert!(matches!(decode(&page, 0, &layout), Err(Error::UnknownNodeKind { tag: 9 })));
    }

    #[test]
    fn test_oversized_node_is_rejected() {
        let layout = layout(Endian::Little, 0);
        let mut leaf = LeafNode::default();
        for key in 0..40 {
            leaf.insert(key, key);
        }
        let node = Node::new(NodeHeader::default(), NodeBody::Leaf(leaf));
        assert!(matches!(encode(&node, &[], &layout), Err(Error::PageOverflow { .. })));
    }
}

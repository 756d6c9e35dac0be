//! Fuzz target for node page decoding.
//!
//! Tests that `codec::decode` never panics on arbitrary page bytes, and that pages it
//! accepts re-encode to pages that decode to the same node. When the first input byte is
//! odd, the page checksum is fixed up first so the body parser is reached.

#![no_main]

use arbor_store::{
    ChecksumType, Endian, PageBuffer,
    btree::{
        codec::{self, PageLayout},
        node::NodeRef,
    },
};
use libfuzzer_sys::fuzz_target;

const PAGE_SIZE: usize = 512;
const LOG_SIZE: usize = 68;
const CHECKSUM_LEN_OFFSET: usize = 6;
const CHECKSUM_OFFSET: usize = 32;
const BODY_OFFSET: usize = 64;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let fix_checksum = data[0] & 1 == 1;
    let layout = PageLayout {
        page_size: PAGE_SIZE,
        log_size: if data[0] & 2 == 2 { LOG_SIZE } else { 0 },
        endian: if data[0] & 4 == 4 { Endian::Big } else { Endian::Little },
        checksum: ChecksumType::Crc32,
    };

    let mut bytes = data[1..].to_vec();
    bytes.resize(PAGE_SIZE, 0);
    if fix_checksum {
        let sum = layout.checksum.compute(&[&bytes[..CHECKSUM_OFFSET], &bytes[BODY_OFFSET..]]);
        let len = (sum.len() as u16).to_le_bytes();
        let len = if layout.endian == Endian::Big { [len[1], len[0]] } else { len };
        bytes[CHECKSUM_LEN_OFFSET..CHECKSUM_LEN_OFFSET + 2].copy_from_slice(&len);
        // The length is covered by the checksum, so compute again with it in place.
        let sum = layout.checksum.compute(&[&bytes[..CHECKSUM_OFFSET], &bytes[BODY_OFFSET..]]);
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + sum.len()].copy_from_slice(&sum);
    }

    let page = PageBuffer::from_vec(bytes, layout.endian);
    let Ok(node) = codec::decode(&page, 7, &layout) else {
        return;
    };

    let children: Vec<u64> = match node.as_internal() {
        Some(internal) => internal.children.iter().filter_map(NodeRef::page).collect(),
        None => Vec::new(),
    };
    let encoded = codec::encode(&node, &children, &layout).expect("decoded node re-encodes");
    let again = codec::decode(&encoded, 7, &layout).expect("re-encoded page decodes");

    assert_eq!(again.header, node.header, "header roundtrip mismatch");
    assert_eq!(again.as_leaf(), node.as_leaf(), "leaf roundtrip mismatch");
    if let (Some(a), Some(b)) = (again.as_internal(), node.as_internal()) {
        assert_eq!(a.keys, b.keys, "internal keys roundtrip mismatch");
        let pages: Vec<u64> = a.children.iter().filter_map(NodeRef::page).collect();
        assert_eq!(pages, children, "child pages roundtrip mismatch");
    }
});

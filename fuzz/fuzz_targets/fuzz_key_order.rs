//! Fuzz target for the order-preserving key mapping.
//!
//! Tests that `Key::to_ordered` preserves the natural order of signed and unsigned keys and
//! that `Key::from_ordered` inverts it.

#![no_main]

use arbor_store::Key;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 16 {
        return;
    }
    let a = u64::from_le_bytes(data[..8].try_into().expect("8 bytes"));
    let b = u64::from_le_bytes(data[8..16].try_into().expect("8 bytes"));

    check(a, b);
    check(a as i64, b as i64);
    check(a as u32, b as u32);
    check(a as i32, b as i32);
});

fn check<K: Key + std::fmt::Debug>(a: K, b: K) {
    assert_eq!(a.cmp(&b), a.to_ordered().cmp(&b.to_ordered()), "order mismatch for {a:?} {b:?}");
    assert_eq!(K::from_ordered(a.to_ordered()), Some(a), "roundtrip mismatch for {a:?}");
}

//! Proptest strategies for tree workloads.
//!
//! Operation sequences draw keys from a bounded key space, so generated workloads revisit
//! keys: overwrites, removals of present keys and removals of absent keys all occur.
//!
//! # Usage
//!
//! ```no_run
//! use arbor_test_utils::strategies::{self, Op};
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(ops in strategies::arb_ops(64, 1..200)) {
//!         for op in ops {
//!             match op {
//!                 Op::Put(key, value) => { /* apply */ }
//!                 Op::Remove(key) => { /* apply */ }
//!             }
//!         }
//!     }
//! }
//! ```

use std::{collections::BTreeMap, ops::Range};

use proptest::prelude::*;

/// One tree mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Insert or overwrite.
    Put(u64, u64),
    /// Remove.
    Remove(u64),
}

impl Op {
    /// Applies the operation to a reference model, returning the previous value.
    pub fn apply(self, model: &mut BTreeMap<u64, u64>) -> Option<u64> {
        match self {
            Op::Put(key, value) => model.insert(key, value),
            Op::Remove(key) => model.remove(&key),
        }
    }
}

/// Generates a key below `key_space`.
pub fn arb_key(key_space: u64) -> impl Strategy<Value = u64> {
    0..key_space.max(1)
}

/// Generates a single operation; puts are three times as likely as removes.
pub fn arb_op(key_space: u64) -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (arb_key(key_space), any::<u64>()).prop_map(|(key, value)| Op::Put(key, value)),
        1 => arb_key(key_space).prop_map(Op::Remove),
    ]
}

/// Generates an operation sequence whose length falls in `len`.
pub fn arb_ops(key_space: u64, len: Range<usize>) -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(arb_op(key_space), len)
}

/// Generates distinct keys in arbitrary order.
pub fn arb_distinct_keys(len: Range<usize>) -> impl Strategy<Value = Vec<u64>> {
    proptest::collection::hash_set(any::<u64>(), len)
        .prop_map(|keys| keys.into_iter().collect())
        .prop_shuffle()
}

/// Generates a value payload of 0-255 random bytes.
pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..256)
}

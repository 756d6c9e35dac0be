//! Key types accepted at the API boundary.
//!
//! The tree orders raw `u64` keys numerically. Other integer types map onto `u64` with an
//! order-preserving transform, so range scans over the mapped keys return them in their
//! natural order:
//! - unsigned integers widen unchanged
//! - signed integers flip the sign bit after widening
//!   (`i64::MIN` -> `0`, `-1` -> `0x7FFF_FFFF_FFFF_FFFF`, `0` -> `0x8000_0000_0000_0000`)

/// Key type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Unsigned integer.
    Unsigned,
    /// Signed integer (sign bit flipped).
    Signed,
}

/// Types that can be used as tree keys.
pub trait Key: Copy + Ord {
    /// The key type discriminant.
    const KEY_TYPE: KeyType;

    /// Maps the key onto the tree's key space, preserving order.
    fn to_ordered(self) -> u64;

    /// Inverse of [`to_ordered`](Self::to_ordered). Returns `None` if `raw` is outside the
    /// image of this type.
    fn from_ordered(raw: u64) -> Option<Self>;
}

const SIGN: u64 = 1 << 63;

impl Key for u64 {
    const KEY_TYPE: KeyType = KeyType::Unsigned;

    fn to_ordered(self) -> u64 {
        self
    }

    fn from_ordered(raw: u64) -> Option<Self> {
        Some(raw)
    }
}

impl Key for u32 {
    const KEY_TYPE: KeyType = KeyType::Unsigned;

    fn to_ordered(self) -> u64 {
        u64::from(self)
    }

    fn from_ordered(raw: u64) -> Option<Self> {
        u32::try_from(raw).ok()
    }
}

impl Key for i64 {
    const KEY_TYPE: KeyType = KeyType::Signed;

    fn to_ordered(self) -> u64 {
        (self as u64) ^ SIGN
    }

    fn from_ordered(raw: u64) -> Option<Self> {
        Some((raw ^ SIGN) as i64)
    }
}

impl Key for i32 {
    const KEY_TYPE: KeyType = KeyType::Signed;

    fn to_ordered(self) -> u64 {
        i64::from(self).to_ordered()
    }

    fn from_ordered(raw: u64) -> Option<Self> {
        i64::from_ordered(raw).and_then(|value| i32::try_from(value).ok())
    }
}

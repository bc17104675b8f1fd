//! # Identifier Algebra
//!
//! This module defines the 160-bit identifier space shared by peers and
//! stored content, plus the composite keys addressing individual entries:
//!
//! - [`Number160`]: 160-bit unsigned integer with XOR distance
//! - [`Number320`]: `(location, domain)`
//! - [`Number480`]: `(location, domain, content)`
//! - [`Number640`]: `(location, domain, content, version)`
//!
//! ## XOR Metric
//!
//! Distance between two identifiers is their bitwise XOR, compared as an
//! unsigned integer. The metric is symmetric, satisfies the triangle
//! inequality, and `d(a, a) == 0`, which is what makes bucketed routing
//! work: the bucket index of a peer is `160 - bit_length(self ^ peer)`.
//!
//! ## Composite Keys
//!
//! Keys are totally ordered lexicographically on their components, so a
//! `BTreeMap<Number640, _>` gives range scans over any location-prefixed
//! interval for free.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of bytes in a 160-bit identifier.
pub const ID_BYTES: usize = 20;

/// Number of bits in an identifier, which is also the bucket count of the
/// routing table.
pub const ID_BITS: usize = 160;

/// A 160-bit unsigned identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Number160([u8; ID_BYTES]);

impl Number160 {
    /// The all-zero sentinel, used as the lower bound of range scans.
    pub const ZERO: Number160 = Number160([0u8; ID_BYTES]);

    /// The all-ones sentinel, used as the upper bound of range scans.
    pub const MAX_VALUE: Number160 = Number160([0xFF; ID_BYTES]);

    #[inline]
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Build an identifier from the low 32 bits of `value`.
    ///
    /// Mostly useful in tests, where small recognizable IDs keep failures
    /// readable.
    pub fn from_u32(value: u32) -> Self {
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 4..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    /// Hash arbitrary bytes into the identifier space (blake3, truncated to
    /// 160 bits).
    pub fn hash_of(input: &[u8]) -> Self {
        let digest = blake3::hash(input);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest.as_bytes()[..ID_BYTES]);
        Self(bytes)
    }

    /// A uniformly random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self(bytes)
    }

    /// Bitwise XOR distance to `other`.
    #[inline]
    pub fn xor(&self, other: &Number160) -> Number160 {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Number160(out)
    }

    /// Position of the highest set bit, counting from 1. Zero has bit
    /// length 0.
    #[inline]
    pub fn bit_length(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bits_below = (ID_BYTES - 1 - byte_idx) * 8;
                return bits_below + (8 - byte.leading_zeros() as usize);
            }
        }
        0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_BYTES];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Compare two identifiers by their XOR distance to `target`, breaking ties
/// by numeric peer-id order.
#[inline]
pub fn distance_then_id(target: &Number160, a: &Number160, b: &Number160) -> Ordering {
    target.xor(a).cmp(&target.xor(b)).then_with(|| a.cmp(b))
}

impl fmt::Debug for Number160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", &self.to_hex()[..8])
    }
}

impl fmt::Display for Number160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A `(location, domain)` key addressing all content under one domain of a
/// location.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct Number320 {
    pub location: Number160,
    pub domain: Number160,
}

impl Number320 {
    pub fn new(location: Number160, domain: Number160) -> Self {
        Self { location, domain }
    }

    /// Smallest `Number640` under this prefix.
    pub fn min_key(&self) -> Number640 {
        Number640::new(self.location, self.domain, Number160::ZERO, Number160::ZERO)
    }

    /// Largest `Number640` under this prefix.
    pub fn max_key(&self) -> Number640 {
        Number640::new(
            self.location,
            self.domain,
            Number160::MAX_VALUE,
            Number160::MAX_VALUE,
        )
    }
}

/// A `(location, domain, content)` key addressing all versions of one entry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct Number480 {
    pub location: Number160,
    pub domain: Number160,
    pub content: Number160,
}

impl Number480 {
    pub fn new(location: Number160, domain: Number160, content: Number160) -> Self {
        Self {
            location,
            domain,
            content,
        }
    }
}

/// The full four-component key of a stored entry.
///
/// Ordering is lexicographic on `(location, domain, content, version)`,
/// which the storage backend relies on for prefix range scans.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct Number640 {
    pub location: Number160,
    pub domain: Number160,
    pub content: Number160,
    pub version: Number160,
}

impl Number640 {
    pub fn new(
        location: Number160,
        domain: Number160,
        content: Number160,
        version: Number160,
    ) -> Self {
        Self {
            location,
            domain,
            content,
            version,
        }
    }

    /// Full range covering every entry stored under `location`.
    pub fn location_range(location: Number160) -> (Number640, Number640) {
        (
            Number640::new(location, Number160::ZERO, Number160::ZERO, Number160::ZERO),
            Number640::new(
                location,
                Number160::MAX_VALUE,
                Number160::MAX_VALUE,
                Number160::MAX_VALUE,
            ),
        )
    }

    #[inline]
    pub fn location_and_domain(&self) -> Number320 {
        Number320::new(self.location, self.domain)
    }

    #[inline]
    pub fn location_domain_and_content(&self) -> Number480 {
        Number480::new(self.location, self.domain, self.content)
    }

    /// The same key with a different version component.
    pub fn with_version(&self, version: Number160) -> Number640 {
        Number640::new(self.location, self.domain, self.content, version)
    }
}

impl fmt::Display for Number640 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[l:{:?},d:{:?},c:{:?},v:{:?}]",
            self.location, self.domain, self.content, self.version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_distance_properties() {
        let a = Number160::random();
        let b = Number160::random();

        assert_eq!(a.xor(&b), b.xor(&a));
        assert_eq!(a.xor(&a), Number160::ZERO);
        assert_eq!(a.xor(&Number160::ZERO), a);
    }

    #[test]
    fn bit_length_boundaries() {
        assert_eq!(Number160::ZERO.bit_length(), 0);
        assert_eq!(Number160::MAX_VALUE.bit_length(), 160);
        assert_eq!(Number160::from_u32(1).bit_length(), 1);
        assert_eq!(Number160::from_u32(0x80).bit_length(), 8);
        assert_eq!(Number160::from_u32(0x100).bit_length(), 9);

        let mut high = [0u8; ID_BYTES];
        high[0] = 0x80;
        assert_eq!(Number160::from_bytes(high).bit_length(), 160);
    }

    #[test]
    fn ordering_is_big_endian_numeric() {
        assert!(Number160::from_u32(1) < Number160::from_u32(2));
        assert!(Number160::from_u32(0xFFFF) < Number160::MAX_VALUE);
        assert!(Number160::ZERO < Number160::from_u32(1));
    }

    #[test]
    fn hex_round_trip() {
        let id = Number160::random();
        assert_eq!(Number160::from_hex(&id.to_hex()).unwrap(), id);
        assert!(Number160::from_hex("abcd").is_err());
    }

    #[test]
    fn hash_of_is_stable() {
        assert_eq!(Number160::hash_of(b"apple"), Number160::hash_of(b"apple"));
        assert_ne!(Number160::hash_of(b"apple"), Number160::hash_of(b"pear"));
    }

    #[test]
    fn distance_tie_break_uses_peer_id() {
        let target = Number160::from_u32(8);
        // Both at distance 12 from nothing in particular; pick ids where
        // distances differ first.
        let near = Number160::from_u32(9); // d = 1
        let far = Number160::from_u32(12); // d = 4
        assert_eq!(distance_then_id(&target, &near, &far), Ordering::Less);

        // Equal ids compare equal.
        assert_eq!(distance_then_id(&target, &near, &near), Ordering::Equal);
    }

    #[test]
    fn composite_key_ordering_is_lexicographic() {
        let a = Number640::new(
            Number160::from_u32(1),
            Number160::from_u32(9),
            Number160::from_u32(9),
            Number160::from_u32(9),
        );
        let b = Number640::new(
            Number160::from_u32(2),
            Number160::ZERO,
            Number160::ZERO,
            Number160::ZERO,
        );
        assert!(a < b);

        let c = a.with_version(Number160::from_u32(10));
        assert!(a < c);
    }

    #[test]
    fn location_range_covers_prefix() {
        let location = Number160::hash_of(b"loc");
        let (min, max) = Number640::location_range(location);
        let key = Number640::new(
            location,
            Number160::from_u32(5),
            Number160::from_u32(7),
            Number160::from_u32(1),
        );
        assert!(min <= key && key <= max);
    }
}

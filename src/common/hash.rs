//! 31-bit peer/key hash and the XOR metric over it.
use std::fmt::{self, Debug, Display, Formatter};

use rand::Rng;

/// Number of significant bits in a [Hash].
pub const HASH_BITS: u8 = 31;

const HASH_MASK: u32 = 0x7fff_ffff;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
/// Top 32 bits of `md5(peerid)` with the most significant bit cleared.
pub struct Hash(u32);

impl Hash {
    /// Hash a peerid, table name or value key.
    pub fn of<T: AsRef<[u8]>>(data: T) -> Hash {
        let digest = md5::compute(data.as_ref());
        let top = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);

        Hash(top & HASH_MASK)
    }

    /// Build a hash from a raw value, clearing the top bit.
    pub fn from_u32(value: u32) -> Hash {
        Hash(value & HASH_MASK)
    }

    pub fn random() -> Hash {
        Hash::from_u32(rand::thread_rng().gen())
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// XOR distance, smaller is closer.
    ///
    /// Distance to self is 0.
    pub fn distance(&self, other: &Hash) -> u32 {
        self.0 ^ other.0
    }

    /// Position of the first bit (from the most significant of the 31) where the
    /// two hashes differ, or [HASH_BITS] if they are equal.
    pub fn first_different_bit(&self, other: &Hash) -> u8 {
        let xor = self.distance(other);
        if xor == 0 {
            return HASH_BITS;
        }

        // the top bit of both is always clear
        (xor.leading_zeros() - 1) as u8
    }

    /// Extract `count` bits starting at `pos`, counted from the most significant of the 31.
    pub fn bits(&self, pos: u8, count: u8) -> u32 {
        debug_assert!(pos + count <= HASH_BITS, "bit range out of the hash");
        if count == 0 || pos >= HASH_BITS {
            return 0;
        }
        let count = count.min(HASH_BITS - pos);
        let shift = HASH_BITS - pos - count;

        (self.0 >> shift) & ((1u32 << count) - 1)
    }

    /// Single bit at `pos`.
    pub fn bit(&self, pos: u8) -> bool {
        self.bits(pos, 1) == 1
    }

    /// Compare against a hash read from the wire, ignoring the top bit that
    /// older encoders may have set.
    pub fn matches_wire(&self, wire: u32) -> bool {
        self.0 == wire & HASH_MASK
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({:08x})", self.0)
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

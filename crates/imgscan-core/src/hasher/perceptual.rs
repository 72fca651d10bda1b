use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const HASH_BITS: u32 = 64;

/// 64-bit perceptual hash. Serialized as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    /// Packs hasher output bytes big-endian. `None` unless exactly 8 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(u64::from_be_bytes(array)))
    }

    pub fn distance(self, other: Self) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Leading `bits` bits as an integer, `bits` in 1..=64.
    pub fn prefix(self, bits: u32) -> u64 {
        self.band(0, bits)
    }

    /// The `index`-th run of `bits` bits from the most significant end.
    /// Requires `(index + 1) * bits <= 64`.
    pub fn band(self, index: u32, bits: u32) -> u64 {
        if bits >= HASH_BITS {
            return self.0;
        }
        let shift = HASH_BITS - (index + 1) * bits;
        (self.0 >> shift) & ((1u64 << bits) - 1)
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PerceptualHash {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(PerceptualHash)
    }
}

impl Serialize for PerceptualHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct HexVisitor;

impl<'de> Visitor<'de> for HexVisitor {
    type Value = PerceptualHash;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a hex encoded 64-bit hash")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        if v.len() != 16 {
            return Err(E::invalid_length(v.len(), &self));
        }
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for PerceptualHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(HexVisitor)
    }
}

/// Every prefix within `radius` bit flips of `prefix`, excluding `prefix` itself.
pub fn neighbor_prefixes(prefix: u64, bits: u32, radius: u32) -> Vec<u64> {
    let mut out = Vec::new();
    flip_from(prefix, bits, radius, 0, &mut out);
    out
}

fn flip_from(value: u64, bits: u32, remaining: u32, start: u32, out: &mut Vec<u64>) {
    if remaining == 0 {
        return;
    }
    for bit in start..bits {
        let flipped = value ^ (1u64 << bit);
        out.push(flipped);
        flip_from(flipped, bits, remaining - 1, bit + 1, out);
    }
}

/// Prefixes within `radius` flips of a `bits`-wide prefix, itself excluded.
/// Saturates instead of overflowing.
pub fn neighbor_count(bits: u32, radius: u32) -> u64 {
    let mut total = 0u64;
    let mut choose = 1u64;
    for k in 1..=radius.min(bits) {
        // C(bits, k) = C(bits, k-1) * (bits-k+1) / k, exact at every step
        choose = match choose.checked_mul(u64::from(bits - k + 1)) {
            Some(product) => product / u64::from(k),
            None => return u64::MAX,
        };
        total = total.saturating_add(choose);
    }
    total
}

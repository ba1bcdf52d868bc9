//! Probabilistic membership filter for SSTable point lookups.
//!
//! A classic bloom filter sized from an expected item count `n` and a target
//! false-positive rate `p`:
//!
//! - bit count `m = ⌈-n·ln(p) / (ln 2)²⌉`
//! - hash count `k = max(1, round((m/n)·ln 2))`
//!
//! Bit positions come from double hashing two independent 32-bit hashes
//! (FNV-1a and DJB2): `h_i = (h1 + i·h2) mod m`. A negative answer is
//! authoritative; a positive answer may be a false positive.
//!
//! # Serialized layout
//!
//! ```text
//! [m:u32 BE][k:u32 BE][bits: ⌈m/8⌉ bytes]
//! ```
//!
//! Bit `i` lives in byte `i / 8` at mask `1 << (i % 8)`.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use thiserror::Error;

const LN2: f64 = std::f64::consts::LN_2;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned when deserializing a filter.
#[derive(Debug, Error)]
pub enum BloomError {
    /// The serialized form was shorter than its header or bit array claims.
    #[error("truncated bloom filter (need {needed} bytes, have {available})")]
    Truncated {
        /// Bytes the layout requires.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// Header fields describe an impossible filter.
    #[error("invalid bloom filter header: {0}")]
    InvalidHeader(String),
}

// ------------------------------------------------------------------------------------------------
// BloomFilter
// ------------------------------------------------------------------------------------------------

/// A serializable bloom filter over string keys.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    /// Number of bits in the filter.
    bit_count: u32,

    /// Number of probe positions per key.
    hash_count: u32,

    /// The bit array, `⌈bit_count / 8⌉` bytes.
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Builds an empty filter sized for `expected_items` keys at the given
    /// false-positive rate.
    ///
    /// `expected_items` of zero is treated as one so the filter stays
    /// well-formed; `false_positive_rate` must be in `(0, 1)` (enforced by
    /// config validation upstream).
    pub fn with_capacity(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let m = (-n * false_positive_rate.ln() / (LN2 * LN2)).ceil();
        let bit_count = (m as u32).max(8);
        let hash_count = (((bit_count as f64 / n) * LN2).round() as u32).max(1);

        Self {
            bit_count,
            hash_count,
            bits: vec![0u8; bit_count.div_ceil(8) as usize],
        }
    }

    /// Number of bits in the filter.
    pub fn bit_count(&self) -> u32 {
        self.bit_count
    }

    /// Number of probe positions per key.
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Marks `key` as present.
    pub fn insert(&mut self, key: &str) {
        let (h1, h2) = Self::hash_pair(key.as_bytes());
        for i in 0..self.hash_count {
            let bit = Self::probe(h1, h2, i, self.bit_count);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Returns `false` only when `key` was definitely never inserted.
    pub fn maybe_contains(&self, key: &str) -> bool {
        let (h1, h2) = Self::hash_pair(key.as_bytes());
        (0..self.hash_count).all(|i| {
            let bit = Self::probe(h1, h2, i, self.bit_count);
            self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }

    /// Serializes to `[m:u32][k:u32][bits]`, big-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.bits.len());
        out.extend_from_slice(&self.bit_count.to_be_bytes());
        out.extend_from_slice(&self.hash_count.to_be_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    /// Parses a filter serialized by [`BloomFilter::to_bytes`].
    ///
    /// Trailing bytes beyond the declared bit array are ignored, so a filter
    /// can be decoded straight out of a larger file section.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, BloomError> {
        if raw.len() < 8 {
            return Err(BloomError::Truncated {
                needed: 8,
                available: raw.len(),
            });
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&raw[0..4]);
        let bit_count = u32::from_be_bytes(word);
        word.copy_from_slice(&raw[4..8]);
        let hash_count = u32::from_be_bytes(word);

        if bit_count == 0 || hash_count == 0 {
            return Err(BloomError::InvalidHeader(format!(
                "bit_count={bit_count}, hash_count={hash_count}"
            )));
        }

        let byte_len = bit_count.div_ceil(8) as usize;
        if raw.len() < 8 + byte_len {
            return Err(BloomError::Truncated {
                needed: 8 + byte_len,
                available: raw.len(),
            });
        }

        Ok(Self {
            bit_count,
            hash_count,
            bits: raw[8..8 + byte_len].to_vec(),
        })
    }

    #[inline]
    fn probe(h1: u32, h2: u32, i: u32, bit_count: u32) -> u32 {
        h1.wrapping_add(i.wrapping_mul(h2)) % bit_count
    }

    #[inline]
    fn hash_pair(data: &[u8]) -> (u32, u32) {
        (Self::fnv1a(data), Self::djb2(data))
    }

    /// 32-bit FNV-1a.
    fn fnv1a(data: &[u8]) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for &byte in data {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }

    /// Bernstein's DJB2.
    fn djb2(data: &[u8]) -> u32 {
        let mut hash: u32 = 5381;
        for &byte in data {
            hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
        }
        hash
    }
}

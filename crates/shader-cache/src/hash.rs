//! Deterministic 64-bit digests.
//!
//! Everything in here must produce identical values across processes and platforms,
//! since digests identify cache entries (including the ones persisted on disk).

use xxhash_rust::xxh3::Xxh3;

/// Offset basis of 64-bit FNV-1a.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
/// Prime of 64-bit FNV-1a.
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Computes 64-bit FNV-1a of the given bytes.
#[inline]
#[must_use]
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Boost-style combination of a digest into a seed.
///
/// Not commutative: `combine64(combine64(s, a), b)` differs from
/// `combine64(combine64(s, b), a)` in general.
#[inline]
#[must_use]
pub const fn combine64(seed: u64, value: u64) -> u64 {
    seed ^ value
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

/// Incremental hasher over a sequence of fields.
///
/// Every variable-length field is prefixed with its length, so `("ab", "c")`
/// and `("a", "bc")` never collide by construction.
#[derive(Clone)]
pub struct ContentHasher {
    /// Streaming state.
    state: Xxh3,
}

impl Default for ContentHasher {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    /// Creates a hasher with the fixed default seed.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self { state: Xxh3::new() }
    }

    /// Feeds a length-prefixed byte field.
    #[inline]
    #[must_use]
    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.state.update(&(bytes.len() as u64).to_le_bytes());
        self.state.update(bytes);
        self
    }

    /// Feeds a length-prefixed string field.
    #[inline]
    #[must_use]
    pub fn str(self, text: &str) -> Self {
        self.bytes(text.as_bytes())
    }

    /// Feeds a fixed-width integer field.
    #[inline]
    #[must_use]
    pub fn u64(mut self, value: u64) -> Self {
        self.state.update(&value.to_le_bytes());
        self
    }

    /// Feeds a single byte field.
    #[inline]
    #[must_use]
    pub fn u8(mut self, value: u8) -> Self {
        self.state.update(&[value]);
        self
    }

    /// Returns the digest of everything fed so far.
    #[inline]
    #[must_use]
    pub fn finish(&self) -> u64 {
        self.state.digest()
    }
}

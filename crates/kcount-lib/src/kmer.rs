//! K-mer representation with a runtime length
//!
//! A [`Kmer`] packs up to [`MAX_K`] bases into a `u64`, two bits per base,
//! first base in the most significant position. Numeric order of the
//! packed value is the lexicographic order of the string, so the
//! canonical form (the smaller of a k-mer and its reverse complement) is
//! the same whichever way it is compared.

use crate::constants::{is_valid_k, MAX_K};
use crate::encoding::{decode_base, encode_base, EncodingError};
use std::fmt;

/// Mask keeping the low `2k` bits.
#[inline]
pub const fn kmer_mask(k: usize) -> u64 {
    if k >= 32 {
        u64::MAX
    } else {
        (1u64 << (2 * k)) - 1
    }
}

/// Reverse complement of the packed `k`-mer `bits`.
///
/// Bit-parallel: complement every base, reverse the 2-bit groups of the
/// whole word, then shift the padding out.
#[inline]
pub const fn reverse_complement_bits(bits: u64, k: usize) -> u64 {
    let mut x = !bits;
    // Swap adjacent 2-bit pairs
    x = ((x >> 2) & 0x3333_3333_3333_3333u64) | ((x & 0x3333_3333_3333_3333u64) << 2);
    // Swap adjacent nibbles
    x = ((x >> 4) & 0x0F0F_0F0F_0F0F_0F0Fu64) | ((x & 0x0F0F_0F0F_0F0F_0F0Fu64) << 4);
    x = x.swap_bytes();
    x >> (64 - 2 * k)
}

/// A k-mer of runtime length `k` (1..=31).
///
/// Ordering compares the packed bases first, so k-mers of one length sort
/// alphabetically.
///
/// # Example
/// ```
/// use kcount_lib::Kmer;
///
/// let kmer = Kmer::from_str("ACGTG").unwrap();
/// assert_eq!(kmer.reverse_complement().to_string(), "CACGT");
/// assert_eq!(kmer.canonical().to_string(), "ACGTG");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Kmer {
    bits: u64,
    k: u8,
}

impl Kmer {
    /// Create a k-mer from raw bits; bits above `2k` are discarded.
    ///
    /// # Panics
    /// If `k` is outside `1..=31`.
    #[inline]
    pub fn new(bits: u64, k: usize) -> Self {
        assert!(is_valid_k(k), "k={} outside 1..={}", k, MAX_K);
        Self { bits: bits & kmer_mask(k), k: k as u8 }
    }

    /// Get the raw bits
    #[inline]
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Number of bases
    #[inline]
    pub fn k(&self) -> usize {
        self.k as usize
    }

    /// Create a k-mer from a DNA string; its length is `k`.
    ///
    /// This is an inherent method so callers don't need to import [`std::str::FromStr`].
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, EncodingError> {
        <Self as std::str::FromStr>::from_str(s)
    }

    /// Create a k-mer from a DNA string that must have exactly `k` bases.
    pub fn from_str_k(s: &str, k: usize) -> Result<Self, EncodingError> {
        if s.len() != k {
            return Err(EncodingError::LengthMismatch { expected: k, actual: s.len() });
        }
        Self::from_str(s)
    }

    /// Get the reverse complement of this k-mer
    #[inline]
    pub fn reverse_complement(&self) -> Self {
        Self { bits: reverse_complement_bits(self.bits, self.k()), k: self.k }
    }

    /// Get the canonical representation (minimum of forward and reverse complement)
    #[inline]
    pub fn canonical(&self) -> Self {
        let rc = self.reverse_complement();
        if self.bits <= rc.bits {
            *self
        } else {
            rc
        }
    }

    /// True if the k-mer equals its own reverse complement.
    #[inline]
    pub fn is_palindrome(&self) -> bool {
        self.bits == reverse_complement_bits(self.bits, self.k())
    }

    /// Extract the 2-bit code of the base at `pos` (0 = first base)
    pub fn get_base(&self, pos: usize) -> u8 {
        assert!(pos < self.k(), "Position {} out of bounds for k-mer of length {}", pos, self.k);
        ((self.bits >> (2 * (self.k() - 1 - pos))) & 0b11) as u8
    }

    /// Shift in a base at the end; the first base is lost.
    #[inline]
    pub fn append_base(self, base: u8) -> Self {
        debug_assert!(base <= 0b11, "Base value must be 0-3");
        Self {
            bits: ((self.bits << 2) | base as u64) & kmer_mask(self.k()),
            k: self.k,
        }
    }
}

impl fmt::Debug for Kmer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kmer<{}>(\"{}\")", self.k, self)
    }
}

impl fmt::Display for Kmer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pos in 0..self.k() {
            write!(f, "{}", decode_base(self.get_base(pos)) as char)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Kmer {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_valid_k(s.len()) {
            return Err(EncodingError::InvalidLength(s.len()));
        }
        let mut bits = 0u64;
        for &base in s.as_bytes() {
            bits = (bits << 2) | encode_base(base)? as u64;
        }
        Ok(Self { bits, k: s.len() as u8 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kmer_from_str() {
        let kmer = Kmer::from_str("ACGTG").unwrap();
        assert_eq!(kmer.k(), 5);
        assert_eq!(kmer.bits(), 0b00_01_10_11_10);
        assert_eq!(kmer.to_string(), "ACGTG");

        let kmer = Kmer::from_str("ACGTACGTACGTACGTACGTACGTACGTACG").unwrap();
        assert_eq!(kmer.to_string(), "ACGTACGTACGTACGTACGTACGTACGTACG");
    }

    #[test]
    fn test_kmer_reverse_complement() {
        let kmer = Kmer::from_str("ACGTG").unwrap();
        assert_eq!(kmer.reverse_complement().to_string(), "CACGT");

        let kmer = Kmer::from_str("ACGTACG").unwrap();
        assert_eq!(kmer.reverse_complement().to_string(), "CGTACGT");

        let kmer = Kmer::from_str("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAC").unwrap();
        assert_eq!(kmer.reverse_complement().to_string(), "GTTTTTTTTTTTTTTTTTTTTTTTTTTTTTT");

        let kmer = Kmer::from_str("G").unwrap();
        assert_eq!(kmer.reverse_complement().to_string(), "C");
    }

    #[test]
    fn test_reverse_complement_is_involution() {
        for s in ["A", "AC", "GATTACA", "TTTTTTTTTTTTTTTTTTTTTTTTTTTTTTT", "CGCGAATTCGCG"] {
            let kmer = Kmer::from_str(s).unwrap();
            assert_eq!(kmer.reverse_complement().reverse_complement(), kmer);
        }
    }

    #[test]
    fn test_kmer_canonical() {
        let kmer = Kmer::from_str("TAC").unwrap();
        assert_eq!(kmer.canonical().to_string(), "GTA");
        let kmer = Kmer::from_str("CGT").unwrap();
        assert_eq!(kmer.canonical().to_string(), "ACG");
        let kmer = Kmer::from_str("ACG").unwrap();
        assert_eq!(kmer.canonical(), kmer);
    }

    #[test]
    fn test_kmer_palindrome() {
        assert!(Kmer::from_str("ACGT").unwrap().is_palindrome());
        assert!(Kmer::from_str("GAATTC").unwrap().is_palindrome());
        assert!(!Kmer::from_str("ACG").unwrap().is_palindrome());
        assert!(!Kmer::from_str("AAAA").unwrap().is_palindrome());
    }

    #[test]
    fn test_kmer_case_insensitive() {
        assert_eq!(Kmer::from_str("acgtg").unwrap(), Kmer::from_str("ACGTG").unwrap());
    }

    #[test]
    fn test_kmer_length_errors() {
        assert_eq!(Kmer::from_str(""), Err(EncodingError::InvalidLength(0)));
        assert!(Kmer::from_str(&"A".repeat(32)).is_err());
        assert_eq!(
            Kmer::from_str_k("ACGT", 5),
            Err(EncodingError::LengthMismatch { expected: 5, actual: 4 })
        );
        assert!(Kmer::from_str("ACNGT").is_err());
    }

    #[test]
    fn test_kmer_get_base_and_append() {
        let kmer = Kmer::from_str("AATAG").unwrap();
        assert_eq!(kmer.get_base(0), 0b00);
        assert_eq!(kmer.get_base(2), 0b11);
        assert_eq!(kmer.get_base(4), 0b10);

        let shifted = kmer.append_base(0b01);
        assert_eq!(shifted.to_string(), "ATAGC");
    }

    #[test]
    fn test_kmer_ordering() {
        let kmer1 = Kmer::from_str("AAAAA").unwrap();
        let kmer2 = Kmer::from_str("AAAAC").unwrap();
        let kmer3 = Kmer::from_str("TTTTT").unwrap();

        assert!(kmer1 < kmer2);
        assert!(kmer2 < kmer3);
        assert!(kmer1 < kmer3);
    }
}

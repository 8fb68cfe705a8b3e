//! DNA nucleotide encoding
//!
//! 2-bit codes in lexicographic order, so that the numeric order of packed
//! k-mers matches the alphabetical order of their strings:
//! - A (65/97)  -> 00
//! - C (67/99)  -> 01
//! - G (71/103) -> 10
//! - T (84/116) -> 11
//!
//! The complement of a code is `3 - code`.

use thiserror::Error;

/// Error type for encoding operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The input byte is not a valid DNA base (A/C/G/T)
    #[error("Invalid DNA base: {0:?}")]
    InvalidBase(u8),
    /// The input string length is not a supported k-mer length
    #[error("Invalid k-mer length: {0}")]
    InvalidLength(usize),
    /// The input string length does not match the expected k-mer length
    #[error("K-mer length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Expected k-mer length
        expected: usize,
        /// Actual string length
        actual: usize,
    },
}

/// Marker in [`CODES`] for bytes that are not a base.
pub const INVALID_CODE: u8 = 0xFF;

/// Byte to 2-bit code lookup table. Anything but `ACGTacgt` maps to
/// [`INVALID_CODE`].
pub static CODES: [u8; 256] = build_code_table();

const fn build_code_table() -> [u8; 256] {
    let mut table = [INVALID_CODE; 256];
    table[b'A' as usize] = 0;
    table[b'a' as usize] = 0;
    table[b'C' as usize] = 1;
    table[b'c' as usize] = 1;
    table[b'G' as usize] = 2;
    table[b'g' as usize] = 2;
    table[b'T' as usize] = 3;
    table[b't' as usize] = 3;
    table
}

/// Encode a single DNA nucleotide to 2 bits
#[inline]
pub fn encode_base(base: u8) -> Result<u8, EncodingError> {
    match CODES[base as usize] {
        INVALID_CODE => Err(EncodingError::InvalidBase(base)),
        code => Ok(code),
    }
}

/// Decode a 2-bit value to DNA nucleotide (uppercase)
#[inline]
pub const fn decode_base(bits: u8) -> u8 {
    match bits & 0b11 {
        0b00 => b'A',
        0b01 => b'C',
        0b10 => b'G',
        _ => b'T',
    }
}

/// Get the complement of a DNA base (encoded)
#[inline]
pub const fn complement_base(bits: u8) -> u8 {
    0b11 - (bits & 0b11)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_base() {
        assert_eq!(encode_base(b'A').unwrap(), 0b00);
        assert_eq!(encode_base(b'a').unwrap(), 0b00);
        assert_eq!(encode_base(b'C').unwrap(), 0b01);
        assert_eq!(encode_base(b'c').unwrap(), 0b01);
        assert_eq!(encode_base(b'G').unwrap(), 0b10);
        assert_eq!(encode_base(b'g').unwrap(), 0b10);
        assert_eq!(encode_base(b'T').unwrap(), 0b11);
        assert_eq!(encode_base(b't').unwrap(), 0b11);

        assert_eq!(encode_base(b'N'), Err(EncodingError::InvalidBase(b'N')));
        assert!(encode_base(b'X').is_err());
        assert!(encode_base(b'\n').is_err());
    }

    #[test]
    fn test_decode_base() {
        for base in [b'A', b'C', b'G', b'T'] {
            assert_eq!(decode_base(encode_base(base).unwrap()), base);
        }
    }

    #[test]
    fn test_complement_base() {
        assert_eq!(complement_base(0b00), 0b11); // A -> T
        assert_eq!(complement_base(0b11), 0b00); // T -> A
        assert_eq!(complement_base(0b01), 0b10); // C -> G
        assert_eq!(complement_base(0b10), 0b01); // G -> C
    }

    #[test]
    fn test_codes_are_ordered() {
        assert!(CODES[b'A' as usize] < CODES[b'C' as usize]);
        assert!(CODES[b'C' as usize] < CODES[b'G' as usize]);
        assert!(CODES[b'G' as usize] < CODES[b'T' as usize]);
        assert_eq!(CODES.iter().filter(|&&c| c != INVALID_CODE).count(), 8);
    }
}

//! Constants and defaults for kcount
//!
//! Limits on the key width, default table and bloom parameters, and the
//! crate version.

/// Default seed for hash functions
pub const DEFAULT_SEED: u64 = 1;

/// Version number
pub const VERSION: (u8, u8, u8) = (0, 1, 0);

/// Maximum k-mer length supported.
///
/// Keys live in the low 62 bits of a `u64`; the top two bits of a slot
/// word hold the slot state.
pub const MAX_K: usize = 31;

/// Minimum k-mer length supported
pub const MIN_K: usize = 1;

/// Default width of a packed counter in the counting table, in bits
pub const DEFAULT_COUNTER_LEN: u32 = 7;

/// Default width of a counter in the final binary output, in bytes
pub const DEFAULT_OUT_COUNTER_LEN: u32 = 4;

/// Counter width of intermediate artifacts, in bytes. Wide enough that
/// merged totals are exact.
pub const INTERMEDIATE_COUNTER_LEN: u32 = 8;

/// Default maximum reprobe count
pub const DEFAULT_MAX_REPROBE: usize = 126;

/// Default false-positive rate for the insert bloom filter
pub const DEFAULT_BF_FP: f64 = 0.01;

/// Default number of bytes a parser block reads from its stream
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;

/// Default number of parser buffers allocated per worker thread
pub const DEFAULT_BUFFERS_PER_THREAD: usize = 3;

/// Check if a k-mer size is valid
#[inline]
pub const fn is_valid_k(k: usize) -> bool {
    k >= MIN_K && k <= MAX_K
}

/// Number of bytes needed to store `bits` bits.
#[inline]
pub const fn bytes_for_bits(bits: u32) -> usize {
    (bits as usize).div_ceil(8)
}

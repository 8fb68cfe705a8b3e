//! Deterministic hasher for keys using ahash.
//!
//! Slot positions in the counting table and probe positions in the bloom
//! structures both come from seeded `AHasher`s. The seeds are stored in
//! artifact headers so a bloom counter snapshot is probed the same way
//! by the run that loads it.

use ahash::RandomState;
use std::hash::{BuildHasher, Hasher};

/// A deterministic hasher with a seeded state
#[derive(Clone)]
pub struct DeterministicHasher {
    seed: u64,
    state: RandomState,
}

impl DeterministicHasher {
    /// Create a new deterministic hasher with the given seed
    pub fn new(seed: u64) -> Self {
        let state = RandomState::with_seeds(seed, !seed, seed.rotate_left(32), !seed.rotate_left(32));
        Self { seed, state }
    }

    /// Hash a u64 value using a seeded AHasher
    #[inline]
    pub fn hash_u64(&self, value: u64) -> u64 {
        let mut hasher = self.state.build_hasher();
        hasher.write_u64(value);
        hasher.finish()
    }

    /// Get the seed value
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl std::fmt::Debug for DeterministicHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeterministicHasher").field("seed", &self.seed).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_hashing() {
        let hasher1 = DeterministicHasher::new(42);
        let hasher2 = DeterministicHasher::new(42);
        let hasher3 = DeterministicHasher::new(43);

        let value = 0x123456789abcdef0u64;

        assert_eq!(hasher1.hash_u64(value), hasher2.hash_u64(value));
        assert_ne!(hasher1.hash_u64(value), hasher3.hash_u64(value));
        assert_eq!(hasher1.seed(), 42);
    }

    #[test]
    fn test_small_keys_spread() {
        let hasher = DeterministicHasher::new(1);
        let mask = 1023u64;
        let mut buckets = std::collections::HashSet::new();
        for key in 0..64u64 {
            buckets.insert(hasher.hash_u64(key) & mask);
        }
        // Consecutive keys must not collapse onto a handful of slots
        assert!(buckets.len() > 48);
    }
}

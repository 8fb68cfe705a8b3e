//! Concurrent counting table
//!
//! [`CountingTable`] pairs a primary [`SlotArray`] of narrow packed
//! counters with an overflow array of full-width counters. When a primary
//! counter overflows, the carry goes to the overflow array under the same
//! key, so the true count is `primary + (overflow << counter_len)`.
//!
//! [`HashCounter`] wraps one table generation and handles the table-full
//! condition by growing or by dumping to an intermediate artifact.

pub mod hash_counter;
pub mod slots;

pub use hash_counter::{HashCounter, Phase};
pub use slots::{SlotArray, TableFull};

use rayon::prelude::*;

use crate::constants::{is_valid_k, DEFAULT_COUNTER_LEN, DEFAULT_MAX_REPROBE, DEFAULT_SEED};
use crate::error::{CountError, Result};
use crate::hasher::DeterministicHasher;

/// Counter width of the overflow array
const OVERFLOW_COUNTER_LEN: u32 = 64;

/// Smallest overflow array
const MIN_OVERFLOW_SIZE: usize = 64;

/// Fixed parameters of a counting table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    /// K-mer length
    pub k: usize,
    /// Requested number of slots, rounded up to a power of two
    pub size: usize,
    /// Width of primary counters in bits
    pub counter_len: u32,
    /// Maximum reprobe count
    pub max_reprobe: usize,
    /// Whether keys are canonical
    pub canonical: bool,
    /// Hash seed
    pub seed: u64,
}

impl TableConfig {
    /// Create a configuration with default counter width and reprobes
    pub fn new(k: usize, size: usize, canonical: bool) -> Self {
        Self {
            k,
            size,
            counter_len: DEFAULT_COUNTER_LEN,
            max_reprobe: DEFAULT_MAX_REPROBE,
            canonical,
            seed: DEFAULT_SEED,
        }
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if !is_valid_k(self.k) {
            return Err(CountError::Config(format!("k must be in range [1, 31], got k={}", self.k)));
        }
        if self.size == 0 {
            return Err(CountError::Config("table size must be positive".to_string()));
        }
        if !(1..=64).contains(&self.counter_len) {
            return Err(CountError::Config(format!(
                "counter length must be in range [1, 64] bits, got {}",
                self.counter_len
            )));
        }
        if self.max_reprobe == 0 {
            return Err(CountError::Config("max reprobe must be positive".to_string()));
        }
        Ok(())
    }

    /// Slot count actually allocated
    pub fn rounded_size(&self) -> usize {
        self.size.next_power_of_two()
    }
}

/// Work left over when an operation hit a full array. Replaying it on a
/// table with room completes the operation exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pending {
    /// Add the delta to the primary counter
    Add(u64),
    /// Make the key present
    Set,
    /// Add the carry to the overflow counter
    Carry(u64),
}

/// Why `update_add` did not complete
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateError {
    /// The key was never primed
    NotPresent,
    /// The primary counter was updated but its carry found no room
    Full(Pending),
}

/// One generation of the counting table
pub struct CountingTable {
    config: TableConfig,
    primary: SlotArray,
    overflow: SlotArray,
}

impl CountingTable {
    /// Allocate a table for `config`
    pub fn new(config: TableConfig) -> Result<Self> {
        config.validate()?;
        let size = config.rounded_size();
        Ok(Self::with_size(config, size))
    }

    fn with_size(mut config: TableConfig, size: usize) -> Self {
        config.size = size;
        let hasher = DeterministicHasher::new(config.seed);
        let primary = SlotArray::new(size, config.counter_len, config.max_reprobe, hasher.clone());
        let overflow_size = (size / 8).max(MIN_OVERFLOW_SIZE).next_power_of_two();
        let overflow = SlotArray::new(overflow_size, OVERFLOW_COUNTER_LEN, config.max_reprobe, hasher);
        Self { config, primary, overflow }
    }

    /// Table parameters; `size` is the allocated slot count
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Number of primary slots
    pub fn capacity(&self) -> usize {
        self.primary.size()
    }

    /// Number of distinct keys in the primary array
    pub fn occupied(&self) -> usize {
        self.primary.used()
    }

    /// True if neither array holds a key. A generation can hold only
    /// overflow entries when a carry was replayed after a dump.
    pub fn is_empty(&self) -> bool {
        self.primary.used() == 0 && self.overflow.used() == 0
    }

    /// Bytes held by both arrays
    pub fn memory_bytes(&self) -> usize {
        self.primary.memory_bytes() + self.overflow.memory_bytes()
    }

    /// Add `delta` to `key`
    #[inline]
    pub fn add(&self, key: u64, delta: u64) -> std::result::Result<(), Pending> {
        match self.primary.add(key, delta) {
            Err(TableFull) => Err(Pending::Add(delta)),
            Ok(0) => Ok(()),
            Ok(carry) => self.add_carry(key, carry),
        }
    }

    /// Make `key` present with a zero counter, leaving an existing counter alone
    #[inline]
    pub fn set(&self, key: u64) -> std::result::Result<(), Pending> {
        self.primary.set(key).map_err(|TableFull| Pending::Set)
    }

    /// Add `delta` to a key made present by an earlier `set` or `add`
    #[inline]
    pub fn update_add(&self, key: u64, delta: u64) -> std::result::Result<(), UpdateError> {
        match self.primary.update_add(key, delta) {
            None => Err(UpdateError::NotPresent),
            Some(0) => Ok(()),
            Some(carry) => self.add_carry(key, carry).map_err(UpdateError::Full),
        }
    }

    /// Replay work left over from a full table
    pub fn apply(&self, key: u64, pending: Pending) -> std::result::Result<(), Pending> {
        match pending {
            Pending::Add(delta) => self.add(key, delta),
            Pending::Set => self.set(key),
            Pending::Carry(carry) => self.add_carry(key, carry),
        }
    }

    fn add_carry(&self, key: u64, carry: u64) -> std::result::Result<(), Pending> {
        match self.overflow.add(key, carry) {
            Ok(high) => {
                // A carry out of a 64-bit overflow counter needs more than
                // 2^64 occurrences
                debug_assert_eq!(high, 0);
                Ok(())
            }
            Err(TableFull) => Err(Pending::Carry(carry)),
        }
    }

    /// Total count of `key`, if present
    pub fn get(&self, key: u64) -> Option<u64> {
        let low = self.primary.get(key);
        let high = self.overflow.get(key);
        match (low, high) {
            (None, None) => None,
            (low, high) => Some(self.combine(low.unwrap_or(0), high.unwrap_or(0))),
        }
    }

    #[inline]
    fn combine(&self, low: u64, high: u64) -> u64 {
        let high = ((high as u128) << self.config.counter_len).min(u64::MAX as u128) as u64;
        low.saturating_add(high)
    }

    /// All (key, total count) pairs sorted by key
    pub fn sorted_entries(&self) -> Vec<(u64, u64)> {
        let mut entries = self.primary.entries();
        entries.extend(
            self.overflow
                .entries()
                .into_iter()
                .map(|(key, high)| (key, self.combine(0, high))),
        );
        entries.par_sort_unstable_by_key(|&(key, _)| key);
        entries.dedup_by(|next, kept| {
            if next.0 == kept.0 {
                kept.1 = kept.1.saturating_add(next.1);
                true
            } else {
                false
            }
        });
        entries
    }

    /// Copy every entry into a table of `new_size` slots. `None` if the
    /// copy itself runs out of room.
    pub fn rehash(&self, new_size: usize) -> Option<CountingTable> {
        let grown = Self::with_size(self.config.clone(), new_size.next_power_of_two());
        let copied = self
            .primary
            .entries()
            .par_iter()
            .try_for_each(|&(key, low)| grown.primary.add(key, low).map(|_| ()));
        copied.ok()?;
        let copied = self
            .overflow
            .entries()
            .par_iter()
            .try_for_each(|&(key, high)| grown.overflow.add(key, high).map(|_| ()));
        copied.ok()?;
        Some(grown)
    }

    /// Empty the table for the next generation
    pub fn clear(&mut self) {
        self.primary.clear();
        self.overflow.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(size: usize, counter_len: u32) -> CountingTable {
        let config = TableConfig { counter_len, ..TableConfig::new(5, size, false) };
        CountingTable::new(config).unwrap()
    }

    #[test]
    fn test_size_rounds_up() {
        let table = table(1000, 7);
        assert_eq!(table.capacity(), 1024);
        assert_eq!(table.config().size, 1024);
    }

    #[test]
    fn test_overflow_escape() {
        let table = table(64, 2);
        for _ in 0..1000 {
            table.add(42, 1).unwrap();
        }
        table.add(42, 1 << 40).unwrap();
        assert_eq!(table.get(42), Some(1000 + (1 << 40)));
        assert_eq!(table.sorted_entries(), vec![(42, 1000 + (1 << 40))]);
    }

    #[test]
    fn test_carry_only_generation_is_not_empty() {
        let mut table = table(64, 1);
        assert!(table.is_empty());
        table.add(7, 1).unwrap();
        table.clear();
        assert!(table.is_empty());

        table.apply(7, Pending::Carry(1)).unwrap();
        assert_eq!(table.occupied(), 0);
        assert!(!table.is_empty());
        assert_eq!(table.sorted_entries(), vec![(7, 2)]);
    }

    #[test]
    fn test_set_then_update() {
        let table = table(64, 3);
        table.set(9).unwrap();
        assert_eq!(table.get(9), Some(0));
        for _ in 0..20 {
            table.update_add(9, 1).unwrap();
        }
        assert_eq!(table.get(9), Some(20));
        assert_eq!(table.update_add(10, 1), Err(UpdateError::NotPresent));
        assert_eq!(table.get(10), None);
    }

    #[test]
    fn test_sorted_entries() {
        let table = table(128, 7);
        for key in [30u64, 2, 17, 2, 30, 30] {
            table.add(key, 1).unwrap();
        }
        assert_eq!(table.sorted_entries(), vec![(2, 2), (17, 1), (30, 3)]);
    }

    #[test]
    fn test_rehash_keeps_counts() {
        let table = table(64, 4);
        for key in 0..40u64 {
            table.add(key, key * 3).unwrap();
        }
        let grown = table.rehash(256).unwrap();
        assert_eq!(grown.capacity(), 256);
        assert_eq!(grown.sorted_entries(), table.sorted_entries());
        assert_eq!(grown.get(39), Some(117));
    }

    #[test]
    fn test_full_reports_pending() {
        let config = TableConfig { max_reprobe: 1, ..TableConfig::new(5, 2, false) };
        let table = CountingTable::new(config).unwrap();
        let mut pending = None;
        for key in 0..64u64 {
            if let Err(p) = table.add(key, 5) {
                pending = Some(p);
                break;
            }
        }
        assert_eq!(pending, Some(Pending::Add(5)));
    }

    #[test]
    fn test_invalid_config() {
        assert!(TableConfig::new(0, 16, false).validate().is_err());
        assert!(TableConfig::new(32, 16, false).validate().is_err());
        assert!(TableConfig::new(5, 0, false).validate().is_err());
        let config = TableConfig { counter_len: 65, ..TableConfig::new(5, 16, false) };
        assert!(config.validate().is_err());
    }
}

//! Lock-free open-addressed slot array
//!
//! Each slot is one `AtomicU64` holding `state << 62 | key`. A slot moves
//! from EMPTY to CLAIMED by compare-and-exchange and from CLAIMED to
//! OCCUPIED once its first delta is in the counter; it never goes back
//! within a table generation.
//!
//! Counters live in a separate array of `AtomicU64` words holding
//! `64 / counter_len` fields each. A field never straddles two words, so a
//! single CAS on the word updates it. An increment that does not fit in
//! the field keeps the low bits and hands the carry back to the caller.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::hasher::DeterministicHasher;

/// Number of bits reserved for the slot state
const STATE_SHIFT: u32 = 62;
/// Low bits of a slot word holding the key
pub const KEY_MASK: u64 = (1u64 << STATE_SHIFT) - 1;
/// Key written, counter not yet published
const CLAIMED: u64 = 0b01 << STATE_SHIFT;
/// Key and counter published
const OCCUPIED: u64 = 0b10 << STATE_SHIFT;

/// The reprobe bound was exhausted before a matching or empty slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableFull;

/// State of a slot as seen by a reader
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Never used in this generation
    Empty,
    /// Key written by its claimer, counter still being initialized
    Claimed,
    /// Key and counter published
    Occupied,
}

#[inline]
fn state_of(word: u64) -> SlotState {
    if word == 0 {
        SlotState::Empty
    } else if word & OCCUPIED != 0 {
        SlotState::Occupied
    } else {
        SlotState::Claimed
    }
}

enum Lookup {
    /// Slot already holds the key
    Found(usize),
    /// Caller claimed an empty slot for the key
    Claimed(usize),
}

/// Fixed-capacity array of (key, counter) slots.
pub struct SlotArray {
    slots: Box<[AtomicU64]>,
    counters: Box<[AtomicU64]>,
    mask: usize,
    counter_len: u32,
    fields_per_word: usize,
    field_mask: u64,
    max_reprobe: usize,
    hasher: DeterministicHasher,
    used: AtomicUsize,
}

impl SlotArray {
    /// Create an array of `size` slots (a power of two) with
    /// `counter_len`-bit counters.
    pub fn new(size: usize, counter_len: u32, max_reprobe: usize, hasher: DeterministicHasher) -> Self {
        debug_assert!(size.is_power_of_two());
        debug_assert!((1..=64).contains(&counter_len));
        let fields_per_word = (64 / counter_len) as usize;
        let field_mask = if counter_len == 64 { u64::MAX } else { (1u64 << counter_len) - 1 };
        let nb_words = size.div_ceil(fields_per_word);
        Self {
            slots: (0..size).map(|_| AtomicU64::new(0)).collect(),
            counters: (0..nb_words).map(|_| AtomicU64::new(0)).collect(),
            mask: size - 1,
            counter_len,
            fields_per_word,
            field_mask,
            max_reprobe,
            hasher,
            used: AtomicUsize::new(0),
        }
    }

    /// Number of slots
    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Counter width in bits
    #[inline]
    pub fn counter_len(&self) -> u32 {
        self.counter_len
    }

    /// Largest value a counter field holds
    #[inline]
    pub fn max_field(&self) -> u64 {
        self.field_mask
    }

    /// Maximum reprobe count
    #[inline]
    pub fn max_reprobe(&self) -> usize {
        self.max_reprobe
    }

    /// Number of claimed or occupied slots
    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Bytes held by the slot and counter arrays
    pub fn memory_bytes(&self) -> usize {
        (self.slots.len() + self.counters.len()) * std::mem::size_of::<u64>()
    }

    /// Slot index probed at reprobe `i` for hash `h`. Triangular offsets
    /// visit every slot of a power-of-two table.
    #[inline]
    fn probe(&self, h: u64, i: usize) -> usize {
        (h as usize).wrapping_add(i * (i + 1) / 2) & self.mask
    }

    fn find_or_claim(&self, key: u64) -> Result<Lookup, TableFull> {
        debug_assert_eq!(key & !KEY_MASK, 0);
        let h = self.hasher.hash_u64(key);
        for i in 0..=self.max_reprobe {
            let idx = self.probe(h, i);
            let slot = &self.slots[idx];
            let mut word = slot.load(Ordering::Acquire);
            if word == 0 {
                match slot.compare_exchange(0, CLAIMED | key, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => {
                        self.used.fetch_add(1, Ordering::Relaxed);
                        return Ok(Lookup::Claimed(idx));
                    }
                    Err(actual) => word = actual,
                }
            }
            if word & KEY_MASK == key {
                return Ok(Lookup::Found(idx));
            }
        }
        Err(TableFull)
    }

    fn find(&self, key: u64) -> Option<usize> {
        let h = self.hasher.hash_u64(key);
        for i in 0..=self.max_reprobe {
            let idx = self.probe(h, i);
            let word = self.slots[idx].load(Ordering::Acquire);
            if word == 0 {
                return None;
            }
            if word & KEY_MASK == key {
                return Some(idx);
            }
        }
        None
    }

    #[inline]
    fn publish(&self, idx: usize, key: u64) {
        self.slots[idx].store(OCCUPIED | key, Ordering::Release);
    }

    /// Add `delta` to the counter of slot `idx`, returning the carry that
    /// did not fit in the field.
    fn add_to_field(&self, idx: usize, delta: u64) -> u64 {
        if delta == 0 {
            return 0;
        }
        let word = &self.counters[idx / self.fields_per_word];
        let shift = (idx % self.fields_per_word) as u32 * self.counter_len;
        let mut current = word.load(Ordering::Relaxed);
        loop {
            let field = (current >> shift) & self.field_mask;
            let sum = field as u128 + delta as u128;
            let low = sum as u64 & self.field_mask;
            let carry = (sum >> self.counter_len) as u64;
            let next = (current & !(self.field_mask << shift)) | (low << shift);
            match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return carry,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    fn field(&self, idx: usize) -> u64 {
        let word = self.counters[idx / self.fields_per_word].load(Ordering::Acquire);
        let shift = (idx % self.fields_per_word) as u32 * self.counter_len;
        (word >> shift) & self.field_mask
    }

    /// Add `delta` to `key`, claiming a slot if the key is new. Returns the
    /// carry out of the counter field.
    pub fn add(&self, key: u64, delta: u64) -> Result<u64, TableFull> {
        match self.find_or_claim(key)? {
            Lookup::Found(idx) => Ok(self.add_to_field(idx, delta)),
            Lookup::Claimed(idx) => {
                let carry = self.add_to_field(idx, delta);
                self.publish(idx, key);
                Ok(carry)
            }
        }
    }

    /// Make `key` present without changing its counter.
    pub fn set(&self, key: u64) -> Result<(), TableFull> {
        if let Lookup::Claimed(idx) = self.find_or_claim(key)? {
            self.publish(idx, key);
        }
        Ok(())
    }

    /// Add `delta` to an existing key. `None` if the key is absent.
    pub fn update_add(&self, key: u64, delta: u64) -> Option<u64> {
        self.find(key).map(|idx| self.add_to_field(idx, delta))
    }

    /// Counter value of `key`, if present
    pub fn get(&self, key: u64) -> Option<u64> {
        self.find(key).map(|idx| self.field(idx))
    }

    /// State of slot `idx`
    pub fn state(&self, idx: usize) -> SlotState {
        state_of(self.slots[idx].load(Ordering::Acquire))
    }

    /// All (key, counter) pairs of non-empty slots, in slot order.
    pub fn entries(&self) -> Vec<(u64, u64)> {
        (0..self.size())
            .into_par_iter()
            .filter_map(|idx| {
                let word = self.slots[idx].load(Ordering::Acquire);
                (word != 0).then(|| (word & KEY_MASK, self.field(idx)))
            })
            .collect()
    }

    /// Reset every slot to EMPTY and every counter to zero.
    pub fn clear(&mut self) {
        self.slots.par_iter_mut().for_each(|slot| *slot.get_mut() = 0);
        self.counters.par_iter_mut().for_each(|word| *word.get_mut() = 0);
        *self.used.get_mut() = 0;
    }
}

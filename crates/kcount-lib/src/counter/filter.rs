//! Key filters applied before counting

use crate::bloom::{BloomCounter, BloomFilter};

/// One link of a [`FilterChain`]
#[derive(Clone, Copy)]
pub enum MerFilter<'a> {
    /// Passes keys seen at least twice in the bloom counter pass
    BloomCounter(&'a BloomCounter),
    /// Inserts the key and passes it only if it was already present
    BloomInsert(&'a BloomFilter),
}

impl MerFilter<'_> {
    /// Whether `key` passes
    #[inline]
    pub fn accept(&self, key: u64) -> bool {
        match self {
            MerFilter::BloomCounter(bc) => bc.check(key) > 1,
            MerFilter::BloomInsert(bf) => bf.insert(key),
        }
    }
}

/// Conjunction of filters, evaluated in order with short-circuit
#[derive(Clone, Default)]
pub struct FilterChain<'a> {
    links: Vec<MerFilter<'a>>,
}

impl<'a> FilterChain<'a> {
    /// Chain passing every key
    pub fn new() -> Self {
        Self { links: Vec::new() }
    }

    /// Append `filter`
    pub fn and(mut self, filter: MerFilter<'a>) -> Self {
        self.links.push(filter);
        self
    }

    /// Number of links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the chain has no link
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Whether `key` passes every link
    #[inline]
    pub fn accept(&self, key: u64) -> bool {
        self.links.iter().all(|filter| filter.accept(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chain_passes() {
        assert!(FilterChain::new().accept(123));
    }

    #[test]
    fn test_bloom_counter_needs_two() {
        let bc = BloomCounter::new(0.001, 100, 5, 1);
        bc.insert(1);
        bc.insert(2);
        bc.insert(2);
        let chain = FilterChain::new().and(MerFilter::BloomCounter(&bc));
        assert!(!chain.accept(1));
        assert!(chain.accept(2));
        assert!(!chain.accept(3));
    }

    #[test]
    fn test_short_circuit_leaves_later_links_untouched() {
        let bc = BloomCounter::new(0.001, 100, 5, 1);
        let bf = BloomFilter::new(0.001, 100, 1);
        let chain = FilterChain::new().and(MerFilter::BloomCounter(&bc)).and(MerFilter::BloomInsert(&bf));
        assert!(!chain.accept(9));
        assert!(!bf.contains(9));
    }

    #[test]
    fn test_bloom_insert_passes_second_occurrence() {
        let bf = BloomFilter::new(0.001, 100, 1);
        let chain = FilterChain::new().and(MerFilter::BloomInsert(&bf));
        assert!(!chain.accept(9));
        assert!(chain.accept(9));
    }
}

//! Shared counter over successive table generations
//!
//! Workers update the current [`CountingTable`] under a read guard, so the
//! per-key path is only atomics. When an operation finds the table full the
//! worker drops its guard and asks for the write lock; taking it waits
//! until every in-flight operation has finished, after which the table is
//! either grown by rehashing or dumped to an intermediate artifact and
//! cleared. The pending part of the operation is then replayed.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::{CountingTable, Pending, TableConfig, UpdateError};
use crate::dumper::Dumper;
use crate::error::{CountError, Result};

/// Counting phase. Dump-and-clear is only allowed while counting; in a
/// two-pass run it would lose primed keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Single-pass counting
    Counting,
    /// First pass of a two-pass run: keys are made present
    Priming,
    /// Second pass: counts go to primed keys only
    Accumulating,
}

impl Phase {
    fn to_u8(self) -> u8 {
        match self {
            Phase::Counting => 0,
            Phase::Priming => 1,
            Phase::Accumulating => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Priming,
            2 => Phase::Accumulating,
            _ => Phase::Counting,
        }
    }
}

struct Generation {
    table: CountingTable,
    id: u64,
}

/// Counting table shared by all workers of a run
pub struct HashCounter {
    current: RwLock<Generation>,
    dumper: Mutex<Option<Dumper>>,
    size_doubling: bool,
    max_size: Option<usize>,
    phase: AtomicU8,
    done: AtomicUsize,
}

impl HashCounter {
    /// Create a counter with one empty table. Without a dumper and with
    /// size doubling off, a full table is a fatal error.
    pub fn new(config: TableConfig) -> Result<Self> {
        let table = CountingTable::new(config)?;
        Ok(Self {
            current: RwLock::new(Generation { table, id: 0 }),
            dumper: Mutex::new(None),
            size_doubling: true,
            max_size: None,
            phase: AtomicU8::new(Phase::Counting.to_u8()),
            done: AtomicUsize::new(0),
        })
    }

    /// Dump full tables through `dumper`
    pub fn with_dumper(mut self, dumper: Dumper) -> Self {
        self.dumper = Mutex::new(Some(dumper));
        self
    }

    /// Allow or forbid growing a full table, optionally up to `max_size` slots
    pub fn with_size_doubling(mut self, enabled: bool, max_size: Option<usize>) -> Self {
        self.size_doubling = enabled;
        self.max_size = max_size;
        self
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Switch phase
    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.to_u8(), Ordering::Release);
    }

    /// Add `delta` to `key`
    pub fn add(&self, key: u64, delta: u64) -> Result<()> {
        let generation = {
            let current = self.current.read();
            match current.table.add(key, delta) {
                Ok(()) => return Ok(()),
                Err(pending) => (pending, current.id),
            }
        };
        self.settle(key, generation)
    }

    /// Make `key` present without counting it
    pub fn set(&self, key: u64) -> Result<()> {
        let generation = {
            let current = self.current.read();
            match current.table.set(key) {
                Ok(()) => return Ok(()),
                Err(pending) => (pending, current.id),
            }
        };
        self.settle(key, generation)
    }

    /// Add `delta` to a primed key; [`CountError::NotPrimed`] if absent
    pub fn update_add(&self, key: u64, delta: u64) -> Result<()> {
        let generation = {
            let current = self.current.read();
            match current.table.update_add(key, delta) {
                Ok(()) => return Ok(()),
                Err(UpdateError::NotPresent) => return Err(CountError::NotPrimed),
                Err(UpdateError::Full(pending)) => (pending, current.id),
            }
        };
        self.settle(key, generation)
    }

    /// Make room and replay `pending` until it lands.
    fn settle(&self, key: u64, (mut pending, mut generation): (Pending, u64)) -> Result<()> {
        loop {
            self.handle_full(generation)?;
            let current = self.current.read();
            match current.table.apply(key, pending) {
                Ok(()) => return Ok(()),
                Err(left) => {
                    pending = left;
                    generation = current.id;
                }
            }
        }
    }

    /// Make room in generation `generation`, unless another worker already did.
    fn handle_full(&self, generation: u64) -> Result<()> {
        let mut current = self.current.write();
        if current.id != generation {
            return Ok(());
        }

        if let Some(grown) = self.grow(&current.table) {
            info!(
                "Table full at {} slots, grown to {} slots ({} MiB)",
                current.table.capacity(),
                grown.capacity(),
                grown.memory_bytes() >> 20
            );
            current.table = grown;
        } else {
            if self.phase() != Phase::Counting {
                return Err(CountError::TableFull { size: current.table.capacity(), generation });
            }
            let mut dumper = self.dumper.lock();
            let Some(dumper) = dumper.as_mut() else {
                return Err(CountError::TableFull { size: current.table.capacity(), generation });
            };
            let path = dumper.dump_intermediate(&current.table)?;
            debug!("Generation {} dumped to {:?}", generation, path);
            current.table.clear();
        }
        current.id += 1;
        Ok(())
    }

    fn grow(&self, table: &CountingTable) -> Option<CountingTable> {
        if !self.size_doubling {
            return None;
        }
        let mut new_size = table.capacity().checked_mul(2)?;
        while self.max_size.map_or(true, |max| new_size <= max) {
            if let Some(grown) = table.rehash(new_size) {
                return Some(grown);
            }
            debug!("Rehash into {} slots ran out of room", new_size);
            new_size = new_size.checked_mul(2)?;
        }
        None
    }

    /// Run `f` on the current table
    pub fn with_table<R>(&self, f: impl FnOnce(&CountingTable) -> R) -> R {
        f(&self.current.read().table)
    }

    /// Number of table generations dumped or grown past
    pub fn generation(&self) -> u64 {
        self.current.read().id
    }

    /// Announce that a worker finished its pass; returns the number of
    /// finished workers.
    pub fn done(&self) -> usize {
        self.done.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of workers that called [`done`](Self::done)
    pub fn nb_done(&self) -> usize {
        self.done.load(Ordering::Acquire)
    }

    /// Forget previous `done` calls
    pub fn reset_done(&self) {
        self.done.store(0, Ordering::Release);
    }

    /// Phase barrier between priming and accumulating: every one of
    /// `workers` must have finished priming.
    pub fn begin_accumulating(&self, workers: usize) -> Result<()> {
        let done = self.nb_done();
        if done != workers {
            return Err(CountError::PrimingIncomplete { done, expected: workers });
        }
        self.reset_done();
        self.set_phase(Phase::Accumulating);
        Ok(())
    }

    /// Take back the last table generation and the dumper
    pub fn into_parts(self) -> (CountingTable, Option<Dumper>) {
        (self.current.into_inner().table, self.dumper.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dumper::OutputFormat;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn small_config(size: usize) -> TableConfig {
        TableConfig { max_reprobe: 4, ..TableConfig::new(11, size, false) }
    }

    #[test]
    fn test_grows_when_full() {
        let counter = HashCounter::new(small_config(8)).unwrap();
        for key in 0..500u64 {
            counter.add(key, 1).unwrap();
        }
        assert!(counter.generation() > 0);
        counter.with_table(|table| {
            assert!(table.capacity() > 8);
            assert_eq!(table.sorted_entries().len(), 500);
        });
    }

    #[test]
    fn test_full_without_dumper_is_fatal() {
        let counter = HashCounter::new(small_config(4)).unwrap().with_size_doubling(false, None);
        let result = (0..100u64).try_for_each(|key| counter.add(key, 1));
        assert!(matches!(result, Err(CountError::TableFull { .. })));
    }

    #[test]
    fn test_max_size_caps_growth() {
        let counter = HashCounter::new(small_config(8)).unwrap().with_size_doubling(true, Some(32));
        let result = (0..1000u64).try_for_each(|key| counter.add(key, 1));
        assert!(matches!(result, Err(CountError::TableFull { .. })));
        counter.with_table(|table| assert!(table.capacity() <= 32));
    }

    #[test]
    fn test_dumps_when_growth_disabled() {
        let dir = TempDir::new().unwrap();
        let dumper = Dumper::new(dir.path().join("out"), 11, false, OutputFormat::Binary { counter_bytes: 4 });
        let counter = HashCounter::new(small_config(16))
            .unwrap()
            .with_size_doubling(false, None)
            .with_dumper(dumper);
        for key in 0..200u64 {
            counter.add(key, 1).unwrap();
        }
        let (table, dumper) = counter.into_parts();
        let dumper = dumper.unwrap();
        assert!(!dumper.intermediates().is_empty());
        assert!(table.occupied() <= 16);
        for path in dumper.intermediates() {
            assert!(path.exists());
        }
    }

    #[test]
    fn test_priming_phase_refuses_to_dump() {
        let dir = TempDir::new().unwrap();
        let dumper = Dumper::new(dir.path().join("out"), 11, false, OutputFormat::Text);
        let counter = HashCounter::new(small_config(4))
            .unwrap()
            .with_size_doubling(false, None)
            .with_dumper(dumper);
        counter.set_phase(Phase::Priming);
        let result = (0..100u64).try_for_each(|key| counter.set(key));
        assert!(matches!(result, Err(CountError::TableFull { .. })));
    }

    #[test]
    fn test_update_add_requires_priming() {
        let counter = HashCounter::new(small_config(64)).unwrap();
        counter.set(7).unwrap();
        counter.update_add(7, 2).unwrap();
        assert!(matches!(counter.update_add(8, 1), Err(CountError::NotPrimed)));
        counter.with_table(|table| {
            assert_eq!(table.get(7), Some(2));
            assert_eq!(table.get(8), None);
        });
    }

    #[test]
    fn test_done_and_phase_barrier() {
        let counter = HashCounter::new(small_config(64)).unwrap();
        counter.set_phase(Phase::Priming);
        assert_eq!(counter.done(), 1);
        assert!(matches!(
            counter.begin_accumulating(2),
            Err(CountError::PrimingIncomplete { done: 1, expected: 2 })
        ));
        assert_eq!(counter.done(), 2);
        counter.begin_accumulating(2).unwrap();
        assert_eq!(counter.nb_done(), 0);
        assert_eq!(counter.phase(), Phase::Accumulating);
    }

    #[test]
    fn test_concurrent_adds_while_growing() {
        let counter = Arc::new(HashCounter::new(small_config(16)).unwrap());
        let threads = 6u64;
        std::thread::scope(|scope| {
            for _ in 0..threads {
                let counter = Arc::clone(&counter);
                scope.spawn(move || {
                    for key in 0..2000u64 {
                        counter.add(key, 1).unwrap();
                    }
                });
            }
        });
        counter.with_table(|table| {
            let entries = table.sorted_entries();
            assert_eq!(entries.len(), 2000);
            assert!(entries.iter().all(|&(_, count)| count == threads));
        });
    }
}

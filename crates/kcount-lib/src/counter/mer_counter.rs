//! Worker loop of a counting pass
//!
//! Each worker pulls blocks from the shared [`SequenceParser`], extracts
//! k-mers, runs them through the filter chain and applies the pass operation
//! to the target. The first fatal error stops every worker at its next
//! record and is returned once all of them have joined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::filter::FilterChain;
use super::mer_iterator::MerExtractor;
use super::parse::{SequenceParser, StreamError};
use crate::bloom::BloomCounter;
use crate::error::{CountError, Result};
use crate::table::HashCounter;

/// What a pass does with each key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Add one occurrence
    Count,
    /// Make the key present without counting it
    Prime,
    /// Add one occurrence to a primed key; other keys are ignored
    Update,
}

/// Shared flag asking a pass to stop between records
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New token, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask running passes to stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Figures of one pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Records read
    pub records: u64,
    /// K-mers extracted
    pub mers: u64,
    /// K-mers rejected by the filter chain
    pub filtered: u64,
    /// Update operations on keys that were never primed
    pub not_primed: u64,
    /// Blocks cut short by a malformed record
    pub malformed_blocks: u64,
    /// Input streams that failed
    pub stream_errors: Vec<StreamError>,
}

impl PassStats {
    /// Add the figures of `other`
    pub fn merge(&mut self, other: PassStats) {
        self.records += other.records;
        self.mers += other.mers;
        self.filtered += other.filtered;
        self.not_primed += other.not_primed;
        self.malformed_blocks += other.malformed_blocks;
        self.stream_errors.extend(other.stream_errors);
    }
}

/// Structure receiving the keys of a pass
#[derive(Clone, Copy)]
pub enum Target<'a> {
    /// Counting table, with the operation applied to each key
    Table(&'a HashCounter, Operation),
    /// Bloom counter being built
    Bloom(&'a BloomCounter),
}

/// Runs one pass over a parser with a pool of worker threads
pub struct MerCounter<'a> {
    target: Target<'a>,
    extractor: MerExtractor,
    filters: FilterChain<'a>,
    cancel: CancelToken,
}

struct Shared<'p> {
    parser: &'p SequenceParser,
    abort: AtomicBool,
    error: Mutex<Option<CountError>>,
}

impl Shared<'_> {
    fn stopped(&self, cancel: &CancelToken) -> bool {
        self.abort.load(Ordering::Acquire) || cancel.is_cancelled()
    }

    fn fail(&self, error: CountError) {
        self.abort.store(true, Ordering::Release);
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}

impl<'a> MerCounter<'a> {
    /// Pass applying `op` to every extracted key of `counter`
    pub fn table(counter: &'a HashCounter, extractor: MerExtractor, op: Operation) -> Self {
        Self { target: Target::Table(counter, op), extractor, filters: FilterChain::new(), cancel: CancelToken::new() }
    }

    /// Pass inserting every extracted key into `bc`
    pub fn bloom(bc: &'a BloomCounter, extractor: MerExtractor) -> Self {
        Self { target: Target::Bloom(bc), extractor, filters: FilterChain::new(), cancel: CancelToken::new() }
    }

    /// Keys must pass `filters` before reaching the target
    pub fn with_filters(mut self, filters: FilterChain<'a>) -> Self {
        self.filters = filters;
        self
    }

    /// Stop when `cancel` is set
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the pass on `threads` workers and wait for all of them
    pub fn run(&self, parser: &SequenceParser, threads: usize) -> Result<PassStats> {
        let start = Instant::now();
        let shared = Shared { parser, abort: AtomicBool::new(false), error: Mutex::new(None) };

        let joined: Vec<thread::Result<PassStats>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..threads.max(1)).map(|_| scope.spawn(|| self.worker(&shared))).collect();
            handles.into_iter().map(|handle| handle.join()).collect()
        });

        let mut stats = PassStats::default();
        let mut panicked = false;
        for result in joined {
            match result {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(_) => panicked = true,
            }
        }
        stats.stream_errors = parser.take_errors();

        if let Some(error) = shared.error.into_inner() {
            return Err(error);
        }
        if panicked {
            return Err(CountError::WorkerPanicked);
        }
        if self.cancel.is_cancelled() {
            warn!("Pass cancelled after {} records", stats.records);
            return Err(CountError::Cancelled);
        }
        for error in &stats.stream_errors {
            warn!("Input {} failed: {}", error.stream, error.message);
        }
        info!(
            "Pass done in {:?}: {} records, {} k-mers, {} filtered",
            start.elapsed(),
            stats.records,
            stats.mers,
            stats.filtered
        );
        Ok(stats)
    }

    fn worker(&self, shared: &Shared<'_>) -> PassStats {
        let mut stats = PassStats::default();
        if let Err(error) = self.process(shared, &mut stats) {
            debug!("Worker stopping: {}", error);
            shared.fail(error);
        }
        if let Target::Table(counter, _) = self.target {
            counter.done();
        }
        stats
    }

    fn process(&self, shared: &Shared<'_>, stats: &mut PassStats) -> Result<()> {
        while let Some(block) = shared.parser.next_block() {
            if shared.stopped(&self.cancel) {
                break;
            }
            let summary = block.for_each_record(|seq, qual| {
                if shared.stopped(&self.cancel) {
                    return Ok(false);
                }
                stats.records += 1;
                for mer in self.extractor.mers(seq, qual) {
                    stats.mers += 1;
                    let key = mer.bits();
                    if !self.filters.accept(key) {
                        stats.filtered += 1;
                        continue;
                    }
                    self.apply(key, stats)?;
                }
                Ok(true)
            })?;
            if let Some(message) = summary.malformed {
                stats.malformed_blocks += 1;
                shared.parser.record_error(block.stream(), format!("malformed record: {}", message));
            }
        }
        Ok(())
    }

    #[inline]
    fn apply(&self, key: u64, stats: &mut PassStats) -> Result<()> {
        match self.target {
            Target::Table(counter, Operation::Count) => counter.add(key, 1),
            Target::Table(counter, Operation::Prime) => counter.set(key),
            Target::Table(counter, Operation::Update) => match counter.update_add(key, 1) {
                Err(CountError::NotPrimed) => {
                    stats.not_primed += 1;
                    Ok(())
                }
                other => other,
            },
            Target::Bloom(bc) => {
                bc.insert(key);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::source::RecordSource;
    use crate::kmer::Kmer;
    use crate::table::TableConfig;
    use tempfile::TempDir;

    fn parser(dir: &TempDir, content: &str) -> SequenceParser {
        let path = dir.path().join("reads.fa");
        std::fs::write(&path, content).unwrap();
        SequenceParser::new(vec![RecordSource::File(path)], 8, 64)
    }

    fn key(s: &str) -> u64 {
        s.parse::<Kmer>().unwrap().bits()
    }

    #[test]
    fn test_count_pass() {
        let dir = TempDir::new().unwrap();
        let reads: String = (0..100).map(|i| format!(">r{}\nACGTACG\n", i)).collect();
        let counter = HashCounter::new(TableConfig::new(3, 64, true)).unwrap();
        let stats = MerCounter::table(&counter, MerExtractor::new(3, true, None), Operation::Count)
            .run(&parser(&dir, &reads), 4)
            .unwrap();
        assert_eq!(stats.records, 100);
        assert_eq!(stats.mers, 500);
        assert_eq!(counter.nb_done(), 4);
        counter.with_table(|table| {
            assert_eq!(table.get(key("ACG")), Some(300));
            assert_eq!(table.get(key("GTA")), Some(200));
        });
    }

    #[test]
    fn test_update_ignores_unprimed() {
        let dir = TempDir::new().unwrap();
        let counter = HashCounter::new(TableConfig::new(3, 64, false)).unwrap();
        counter.set(key("ACG")).unwrap();
        let stats = MerCounter::table(&counter, MerExtractor::new(3, false, None), Operation::Update)
            .run(&parser(&dir, ">r\nACGTACG\n"), 2)
            .unwrap();
        assert_eq!(stats.not_primed, 3);
        counter.with_table(|table| {
            assert_eq!(table.get(key("ACG")), Some(2));
            assert_eq!(table.get(key("CGT")), None);
        });
    }

    #[test]
    fn test_bloom_target() {
        let dir = TempDir::new().unwrap();
        let bc = BloomCounter::new(0.001, 100, 3, 1);
        MerCounter::bloom(&bc, MerExtractor::new(3, false, None)).run(&parser(&dir, ">r\nACGTACG\n"), 1).unwrap();
        assert_eq!(bc.check(key("ACG")), 2);
        assert!(bc.check(key("CGT")) >= 1);
    }

    #[test]
    fn test_cancelled_pass() {
        let dir = TempDir::new().unwrap();
        let counter = HashCounter::new(TableConfig::new(3, 64, false)).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = MerCounter::table(&counter, MerExtractor::new(3, false, None), Operation::Count)
            .with_cancel(cancel)
            .run(&parser(&dir, ">r\nACGTACG\n"), 2);
        assert!(matches!(result, Err(CountError::Cancelled)));
        counter.with_table(|table| assert_eq!(table.occupied(), 0));
    }

    #[test]
    fn test_fatal_error_stops_all_workers() {
        let dir = TempDir::new().unwrap();
        let reads: String = (0..50).map(|i| format!(">r{}\n{}\n", i, "ACGGTCATTGCAGT".repeat(i % 7 + 1))).collect();
        let config = TableConfig { max_reprobe: 2, ..TableConfig::new(5, 4, false) };
        let counter = HashCounter::new(config).unwrap().with_size_doubling(false, None);
        let result = MerCounter::table(&counter, MerExtractor::new(5, false, None), Operation::Count)
            .run(&parser(&dir, &reads), 3);
        assert!(matches!(result, Err(CountError::TableFull { .. })));
    }

    #[test]
    fn test_malformed_block_is_recorded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reads.fq");
        std::fs::write(&path, "@r\nACGT\n+\nII\n").unwrap();
        let parser = SequenceParser::new(vec![RecordSource::File(path)], 2, 1024);
        let counter = HashCounter::new(TableConfig::new(3, 64, false)).unwrap();
        let stats = MerCounter::table(&counter, MerExtractor::new(3, false, None), Operation::Count)
            .run(&parser, 1)
            .unwrap();
        assert_eq!(stats.malformed_blocks, 1);
        assert_eq!(stats.stream_errors.len(), 1);
    }
}

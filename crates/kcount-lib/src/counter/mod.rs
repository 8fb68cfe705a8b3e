//! Counting runs
//!
//! [`count`] drives a whole run:
//!
//! 1. load the bloom counter, if any, and allocate the bloom filter
//! 2. optionally prime the table from `prime_inputs`, then wait until every
//!    worker is done before switching to accumulation
//! 3. count (or update) the k-mers of `inputs` on a pool of workers
//! 4. write the table directly, or dump the last generation and merge it
//!    with the intermediates
//!
//! [`build_bloom_counter`] runs the same parser and extractor but inserts
//! every k-mer into a [`BloomCounter`] and saves it.

pub mod config;
pub mod filter;
pub mod mer_counter;
pub mod mer_iterator;
pub mod parse;
pub mod source;

pub use config::{quality_threshold, BloomConfig, CountConfig};
pub use filter::{FilterChain, MerFilter};
pub use mer_counter::{CancelToken, MerCounter, Operation, PassStats};
pub use mer_iterator::MerExtractor;
pub use parse::{SequenceParser, StreamError};
pub use source::RecordSource;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bloom::{BloomCounter, BloomFilter};
use crate::dumper::Dumper;
use crate::error::Result;
use crate::merge::{merge_artifacts, MergeOptions};
use crate::table::{CountingTable, HashCounter, Phase};

/// Outcome of a counting run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CountSummary {
    /// Final artifact, `None` when nothing was written or merging was skipped
    pub output: Option<PathBuf>,
    /// Intermediate artifacts left on disk
    pub intermediates: Vec<PathBuf>,
    /// Distinct k-mers in the final artifact before range filtering
    pub distinct: u64,
    /// Records in the final artifact
    pub written: u64,
    /// Slots of the last table generation
    pub table_size: usize,
    /// Priming pass figures
    pub prime: Option<PassStats>,
    /// Counting pass figures
    pub pass: PassStats,
}

/// Run a counting job
pub fn count(config: &CountConfig) -> Result<CountSummary> {
    count_with_cancel(config, &CancelToken::new())
}

/// Run a counting job that stops early once `cancel` is set
pub fn count_with_cancel(config: &CountConfig, cancel: &CancelToken) -> Result<CountSummary> {
    config.validate()?;
    config.print();
    let start = Instant::now();
    let threads = config.num_threads();
    let buffers = threads * config.buffers_per_thread;

    let bloom_counter = config.bloom_counter.as_ref().map(|path| BloomCounter::load(path, config.k, config.canonical)).transpose()?;
    let bloom_filter = config.bf_size.map(|n| BloomFilter::new(config.bf_fp, n, config.seed));
    if let Some(bf) = &bloom_filter {
        debug!("Bloom filter: {} bits, {} hashes", bf.size(), bf.nb_hashes());
    }

    let counter = HashCounter::new(config.table_config())?
        .with_size_doubling(config.size_doubling, config.max_size)
        .with_dumper(make_dumper(config));
    let extractor = MerExtractor::new(config.k, config.canonical, config.min_qual);
    let init = start.elapsed();

    let prime = if config.prime_inputs.is_empty() {
        None
    } else {
        info!("Priming from {} inputs", config.prime_inputs.len());
        counter.set_phase(Phase::Priming);
        let parser = SequenceParser::new(config.prime_inputs.clone(), buffers, config.block_size);
        let stats = MerCounter::table(&counter, extractor, Operation::Prime)
            .with_cancel(cancel.clone())
            .run(&parser, threads)?;
        counter.begin_accumulating(threads)?;
        Some(stats)
    };
    let op = if prime.is_some() { Operation::Update } else { Operation::Count };

    let mut filters = FilterChain::new();
    if let Some(bc) = &bloom_counter {
        filters = filters.and(MerFilter::BloomCounter(bc));
    }
    if let Some(bf) = &bloom_filter {
        filters = filters.and(MerFilter::BloomInsert(bf));
    }
    let parser = SequenceParser::new(config.inputs.clone(), buffers, config.block_size);
    let pass = MerCounter::table(&counter, extractor, op)
        .with_filters(filters)
        .with_cancel(cancel.clone())
        .run(&parser, threads)?;
    if pass.not_primed > 0 {
        debug!("{} k-mers were not primed", pass.not_primed);
    }
    let counting = start.elapsed() - init;

    let (table, dumper) = counter.into_parts();
    let dumper = dumper.unwrap_or_else(|| make_dumper(config));
    let mut summary = CountSummary { table_size: table.capacity(), prime, pass, ..CountSummary::default() };
    write_output(config, &table, dumper, &mut summary)?;
    let writing = start.elapsed() - init - counting;

    if let Some(path) = &config.timing {
        write_timing(path, init, counting, writing)?;
    }
    info!(
        "Counted {} distinct k-mers ({} written) in {:?}",
        summary.distinct,
        summary.written,
        start.elapsed()
    );
    Ok(summary)
}

fn make_dumper(config: &CountConfig) -> Dumper {
    Dumper::new(&config.output, config.k, config.canonical, config.output_format()).with_cmdline(config.cmdline.clone())
}

fn write_output(config: &CountConfig, table: &CountingTable, mut dumper: Dumper, summary: &mut CountSummary) -> Result<()> {
    if config.no_write {
        info!("Skipping output");
        remove_intermediates(config, dumper.intermediates(), summary);
        return Ok(());
    }

    if dumper.intermediates().is_empty() {
        let dump = dumper.dump_final(table, config.count_range())?;
        summary.output = Some(dump.path);
        summary.distinct = dump.distinct;
        summary.written = dump.written;
        return Ok(());
    }

    if !table.is_empty() {
        dumper.dump_intermediate(table)?;
    }
    let intermediates = dumper.intermediates().to_vec();
    if config.no_merge {
        info!("Leaving {} intermediates unmerged", intermediates.len());
        summary.intermediates = intermediates;
        return Ok(());
    }

    let options = MergeOptions {
        format: config.output_format(),
        range: config.count_range(),
        cmdline: config.cmdline.clone(),
    };
    let merged = merge_artifacts(&intermediates, &config.output, &options)?;
    summary.output = Some(config.output.clone());
    summary.distinct = merged.distinct;
    summary.written = merged.written;
    remove_intermediates(config, &intermediates, summary);
    Ok(())
}

fn remove_intermediates(config: &CountConfig, intermediates: &[PathBuf], summary: &mut CountSummary) {
    if config.no_unlink {
        summary.intermediates = intermediates.to_vec();
        return;
    }
    for path in intermediates {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Cannot remove {:?}: {}", path, e);
            summary.intermediates.push(path.clone());
        }
    }
}

fn write_timing(path: &Path, init: Duration, counting: Duration, writing: Duration) -> Result<()> {
    let report = format!(
        "Init     {:.6}\nCounting {:.6}\nWriting  {:.6}\n",
        init.as_secs_f64(),
        counting.as_secs_f64(),
        writing.as_secs_f64()
    );
    std::fs::write(path, report)?;
    Ok(())
}

/// Build a bloom counter from `config.inputs` and save it to `config.output`
pub fn build_bloom_counter(config: &BloomConfig) -> Result<BloomCounter> {
    config.validate()?;
    config.print();
    let start = Instant::now();
    let threads = config.num_threads();

    let bc = BloomCounter::new(config.fp, config.size, config.k, config.seed);
    info!("Bloom counter: {} cells, {} hashes", bc.size(), bc.nb_hashes());
    let parser = SequenceParser::new(config.inputs.clone(), threads * config.buffers_per_thread, config.block_size);
    let extractor = MerExtractor::new(config.k, config.canonical, config.min_qual);
    let stats = MerCounter::bloom(&bc, extractor).run(&parser, threads)?;

    bc.save(&config.output, config.canonical, &config.cmdline)?;
    info!("Inserted {} k-mers from {} records in {:?}", stats.mers, stats.records, start.elapsed());
    Ok(bc)
}

//! Report printing for the `count`, `histo`, `stats` and `info` subcommands

use anyhow::Context;
use kcount_lib::counter::PassStats;
use kcount_lib::serialization::{ArtifactHeader, FormatTag};
use kcount_lib::{ArtifactStats, Histogram};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

/// Log the figures of one pass
pub fn print_pass(name: &str, stats: &PassStats) {
    info!("{} pass:", name);
    info!("  records = {}", stats.records);
    info!("  k-mers = {}", stats.mers);
    if stats.filtered > 0 {
        info!("  filtered = {}", stats.filtered);
    }
    if stats.not_primed > 0 {
        info!("  not primed = {}", stats.not_primed);
    }
    if stats.malformed_blocks > 0 {
        warn!("  malformed blocks = {}", stats.malformed_blocks);
    }
    for error in &stats.stream_errors {
        warn!("  {}: {}", error.stream, error.message);
    }
}

/// Write histogram rows to `output`, or stdout
pub fn write_histogram(histo: &Histogram, output: Option<&Path>, full: bool) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            let mut out = BufWriter::new(file);
            histo.write_to(&mut out, full)?;
            out.flush()?;
        }
        None => {
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            histo.write_to(&mut out, full)?;
            out.flush()?;
        }
    }
    Ok(())
}

/// Print artifact statistics to stdout
pub fn print_stats(stats: &ArtifactStats) {
    println!("Unique:    {}", stats.unique);
    println!("Distinct:  {}", stats.distinct);
    println!("Total:     {}", stats.total);
    println!("Max_count: {}", stats.max_count);
}

/// Print the header of an artifact to stdout
pub fn print_info(path: &Path) -> anyhow::Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let header = ArtifactHeader::read(&mut BufReader::new(file))
        .with_context(|| format!("Failed to read header of {}", path.display()))?;
    print_header(&header);
    Ok(())
}

fn print_header(header: &ArtifactHeader) {
    println!("format:       {}", header.format.name());
    println!("k:            {}", header.k());
    println!("canonical:    {}", header.canonical);
    match header.format {
        FormatTag::Binary => println!("counter bytes: {}", header.counter_bytes),
        FormatTag::BloomCounter => println!("hashes:       {}", header.nb_hashes),
        FormatTag::Text => {}
    }
    println!("size:         {}", header.size);
    println!("max reprobe:  {}", header.max_reprobe);
    println!("seeds:        {:#x} {:#x}", header.seeds[0], header.seeds[1]);
    if !header.cmdline.is_empty() {
        println!("command:      {}", header.cmdline);
    }
}

//! Table dumps
//!
//! A table generation is written sorted by key. When the whole run fits in
//! one generation the final file is written directly, with the count range
//! applied. Otherwise each full generation becomes a numbered intermediate
//! artifact (`{output}_0`, `{output}_1`, ...) with exact 8-byte counters and
//! no filtering; the merge applies the range later.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info};

use crate::artifact::ArtifactWriter;
use crate::constants::INTERMEDIATE_COUNTER_LEN;
use crate::error::Result;
use crate::serialization::{intermediate_path, ArtifactHeader, FormatTag};
use crate::table::CountingTable;

/// Encoding of an output artifact
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Fixed-width binary records with `counter_bytes`-byte counts
    Binary {
        /// Width of a count in bytes (1..=8)
        counter_bytes: u32,
    },
    /// `KMER COUNT` lines
    Text,
}

impl OutputFormat {
    /// Header for a dump of `k`-mers in this format
    pub fn header(self, k: usize, canonical: bool) -> ArtifactHeader {
        match self {
            OutputFormat::Binary { counter_bytes } => {
                ArtifactHeader::dump(FormatTag::Binary, k, counter_bytes, canonical)
            }
            OutputFormat::Text => ArtifactHeader::dump(FormatTag::Text, k, 0, canonical),
        }
    }
}

/// Inclusive count range kept in final output
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountRange {
    /// Smallest count kept
    pub min: u64,
    /// Largest count kept
    pub max: u64,
}

impl CountRange {
    /// Range from optional bounds
    pub fn new(min: Option<u64>, max: Option<u64>) -> Self {
        Self { min: min.unwrap_or(0), max: max.unwrap_or(u64::MAX) }
    }

    /// Whether `count` is kept
    #[inline]
    pub fn contains(&self, count: u64) -> bool {
        self.min <= count && count <= self.max
    }
}

impl Default for CountRange {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Summary of one written artifact
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpSummary {
    /// Artifact path
    pub path: PathBuf,
    /// Distinct keys in the table
    pub distinct: u64,
    /// Records written after range filtering
    pub written: u64,
}

/// Writes table generations to disk
pub struct Dumper {
    output: PathBuf,
    k: usize,
    canonical: bool,
    format: OutputFormat,
    cmdline: String,
    intermediates: Vec<PathBuf>,
}

impl Dumper {
    /// Dumper for the final artifact `output`
    pub fn new<P: AsRef<Path>>(output: P, k: usize, canonical: bool, format: OutputFormat) -> Self {
        Self {
            output: output.as_ref().to_path_buf(),
            k,
            canonical,
            format,
            cmdline: String::new(),
            intermediates: Vec::new(),
        }
    }

    /// Record `cmdline` in every header written
    pub fn with_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = cmdline.into();
        self
    }

    /// Final output path
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Intermediate artifacts written so far, in generation order
    pub fn intermediates(&self) -> &[PathBuf] {
        &self.intermediates
    }

    /// Format of the final artifact
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    fn header(&self, format: OutputFormat, table: &CountingTable) -> ArtifactHeader {
        let config = table.config();
        let mut header = format.header(self.k, self.canonical);
        header.seeds = [config.seed, 0];
        header.size = table.capacity() as u64;
        header.max_reprobe = config.max_reprobe as u32;
        header.cmdline = self.cmdline.clone();
        header
    }

    /// Write the table as the next intermediate artifact
    pub fn dump_intermediate(&mut self, table: &CountingTable) -> Result<PathBuf> {
        let path = intermediate_path(&self.output, self.intermediates.len());
        let format = OutputFormat::Binary { counter_bytes: INTERMEDIATE_COUNTER_LEN };
        let summary = self.write(&path, self.header(format, table), table, CountRange::default())?;
        info!("Intermediate dump {}: {} keys to {:?}", self.intermediates.len(), summary.written, path);
        self.intermediates.push(path.clone());
        Ok(path)
    }

    /// Write the table as the final artifact, keeping counts in `range`
    pub fn dump_final(&self, table: &CountingTable, range: CountRange) -> Result<DumpSummary> {
        let header = self.header(self.format, table);
        self.write(&self.output, header, table, range)
    }

    fn write(&self, path: &Path, header: ArtifactHeader, table: &CountingTable, range: CountRange) -> Result<DumpSummary> {
        let start = Instant::now();
        let entries = table.sorted_entries();
        debug!("Sorted {} entries in {:?}", entries.len(), start.elapsed());

        let mut writer = ArtifactWriter::create(path, header)?;
        for &(key, count) in entries.iter().filter(|(_, count)| range.contains(*count)) {
            writer.write(key, count)?;
        }
        let written = writer.finish()?;
        debug!("Wrote {} records to {:?} in {:?}", written, path, start.elapsed());
        Ok(DumpSummary { path: path.to_path_buf(), distinct: entries.len() as u64, written })
    }
}

//! Configuration of counting and bloom counter runs

use std::path::PathBuf;

use crate::constants::{
    is_valid_k, DEFAULT_BF_FP, DEFAULT_BLOCK_SIZE, DEFAULT_BUFFERS_PER_THREAD, DEFAULT_COUNTER_LEN,
    DEFAULT_MAX_REPROBE, DEFAULT_OUT_COUNTER_LEN, DEFAULT_SEED, MAX_K, MIN_K,
};
use crate::dumper::{CountRange, OutputFormat};
use crate::error::{CountError, Result};
use crate::table::TableConfig;

use super::source::RecordSource;

/// Lowest printable quality character
pub const MIN_QUAL_CHAR: u8 = b'!';
/// Highest printable quality character
pub const MAX_QUAL_CHAR: u8 = b'~';
/// Default Phred offset
pub const DEFAULT_QUALITY_START: u8 = 33;

/// Quality threshold byte from either a character or a Phred score plus
/// offset. The result must be printable ASCII.
pub fn quality_threshold(min_char: Option<char>, min_quality: Option<u8>, quality_start: u8) -> Result<Option<u8>> {
    let threshold = match (min_char, min_quality) {
        (Some(_), Some(_)) => {
            return Err(CountError::Config(
                "give either a minimum quality character or a minimum quality score, not both".to_string(),
            ))
        }
        (Some(c), None) => {
            if !c.is_ascii() {
                return Err(CountError::Config(format!("quality character {:?} is not ASCII", c)));
            }
            c as u32
        }
        (None, Some(q)) => quality_start as u32 + q as u32,
        (None, None) => return Ok(None),
    };
    if !(MIN_QUAL_CHAR as u32..=MAX_QUAL_CHAR as u32).contains(&threshold) {
        return Err(CountError::Config(format!(
            "quality threshold {} is outside printable ASCII [{}, {}]",
            threshold, MIN_QUAL_CHAR, MAX_QUAL_CHAR
        )));
    }
    Ok(Some(threshold as u8))
}

fn threads_or_all(threads: usize) -> usize {
    if threads == 0 {
        rayon::current_num_threads()
    } else {
        threads
    }
}

/// Parameters of a counting run
#[derive(Debug, Clone)]
pub struct CountConfig {
    /// K-mer length (1..=31)
    pub k: usize,

    /// Initial number of table slots (rounded up to a power of two)
    pub size: usize,

    /// Bits per in-table counter
    pub counter_len: u32,

    /// Bytes per count in the final binary output
    pub out_counter_len: u32,

    /// Maximum probe index
    pub max_reprobe: usize,

    /// Count k-mers and their reverse complements together
    pub canonical: bool,

    /// Worker threads (0 = all available cores)
    pub threads: usize,

    /// Final output path; intermediates are named `{output}_{i}`
    pub output: PathBuf,

    /// Write the output as text
    pub text: bool,

    /// Drop k-mers counted fewer times
    pub lower_count: Option<u64>,

    /// Drop k-mers counted more times
    pub upper_count: Option<u64>,

    /// Grow a full table instead of dumping it. Off in disk mode.
    pub size_doubling: bool,

    /// Upper bound on table slots when growing
    pub max_size: Option<usize>,

    /// Bloom counter snapshot; only k-mers seen twice in it are counted
    pub bloom_counter: Option<PathBuf>,

    /// Expected distinct k-mers for a bloom filter passing repeats only
    pub bf_size: Option<u64>,

    /// False-positive rate of that bloom filter
    pub bf_fp: f64,

    /// Sources of the counting pass
    pub inputs: Vec<RecordSource>,

    /// Sources of the priming pass; when set, only primed k-mers are counted
    pub prime_inputs: Vec<RecordSource>,

    /// Quality bytes below this break k-mers
    pub min_qual: Option<u8>,

    /// Write phase durations here
    pub timing: Option<PathBuf>,

    /// Leave intermediates unmerged
    pub no_merge: bool,

    /// Keep intermediates after merging
    pub no_unlink: bool,

    /// Count without writing any output
    pub no_write: bool,

    /// Hash seed
    pub seed: u64,

    /// Bytes read per parser block
    pub block_size: usize,

    /// Parser buffers per worker thread
    pub buffers_per_thread: usize,

    /// Command line stored in artifact headers
    pub cmdline: String,
}

impl Default for CountConfig {
    fn default() -> Self {
        Self {
            k: 21,
            size: 10_000_000,
            counter_len: DEFAULT_COUNTER_LEN,
            out_counter_len: DEFAULT_OUT_COUNTER_LEN,
            max_reprobe: DEFAULT_MAX_REPROBE,
            canonical: false,
            threads: 0,
            output: PathBuf::from("mer_counts.kc"),
            text: false,
            lower_count: None,
            upper_count: None,
            size_doubling: true,
            max_size: None,
            bloom_counter: None,
            bf_size: None,
            bf_fp: DEFAULT_BF_FP,
            inputs: Vec::new(),
            prime_inputs: Vec::new(),
            min_qual: None,
            timing: None,
            no_merge: false,
            no_unlink: false,
            no_write: false,
            seed: DEFAULT_SEED,
            block_size: DEFAULT_BLOCK_SIZE,
            buffers_per_thread: DEFAULT_BUFFERS_PER_THREAD,
            cmdline: String::new(),
        }
    }
}

impl CountConfig {
    /// Configuration counting `k`-mers of `inputs` into `output`
    pub fn new(k: usize, size: usize, inputs: Vec<RecordSource>, output: impl Into<PathBuf>) -> Result<Self> {
        let config = Self { k, size, inputs, output: output.into(), ..Self::default() };
        config.validate()?;
        Ok(config)
    }

    /// Check the parameters
    pub fn validate(&self) -> Result<()> {
        if !is_valid_k(self.k) {
            return Err(CountError::Config(format!("k must be in range [{}, {}], got k={}", MIN_K, MAX_K, self.k)));
        }
        self.table_config().validate()?;
        if !(1..=8).contains(&self.out_counter_len) {
            return Err(CountError::Config(format!(
                "output counter length must be 1 to 8 bytes, got {}",
                self.out_counter_len
            )));
        }
        if self.inputs.is_empty() {
            return Err(CountError::Config("no input to count".to_string()));
        }
        if let (Some(lower), Some(upper)) = (self.lower_count, self.upper_count) {
            if lower > upper {
                return Err(CountError::Config(format!("lower count {} is above upper count {}", lower, upper)));
            }
        }
        if let Some(max_size) = self.max_size {
            if max_size < self.size {
                return Err(CountError::Config(format!(
                    "maximum table size {} is below the initial size {}",
                    max_size, self.size
                )));
            }
        }
        if self.bf_size == Some(0) {
            return Err(CountError::Config("bloom filter size must be positive".to_string()));
        }
        if !(self.bf_fp > 0.0 && self.bf_fp < 1.0) {
            return Err(CountError::Config(format!("false positive rate must be in (0, 1), got {}", self.bf_fp)));
        }
        if let Some(q) = self.min_qual {
            if !(MIN_QUAL_CHAR..=MAX_QUAL_CHAR).contains(&q) {
                return Err(CountError::Config(format!("quality threshold {} is not printable ASCII", q)));
            }
        }
        if self.block_size == 0 || self.buffers_per_thread == 0 {
            return Err(CountError::Config("block size and buffers per thread must be positive".to_string()));
        }
        Ok(())
    }

    /// Worker threads to start
    pub fn num_threads(&self) -> usize {
        threads_or_all(self.threads)
    }

    /// Table parameters
    pub fn table_config(&self) -> TableConfig {
        TableConfig {
            k: self.k,
            size: self.size,
            counter_len: self.counter_len,
            max_reprobe: self.max_reprobe,
            canonical: self.canonical,
            seed: self.seed,
        }
    }

    /// Encoding of the final output
    pub fn output_format(&self) -> OutputFormat {
        if self.text {
            OutputFormat::Text
        } else {
            OutputFormat::Binary { counter_bytes: self.out_counter_len }
        }
    }

    /// Counts kept in the final output
    pub fn count_range(&self) -> CountRange {
        CountRange::new(self.lower_count, self.upper_count)
    }

    /// Log configuration parameters via tracing
    pub fn print(&self) {
        tracing::info!("Count Configuration:");
        tracing::info!("  k = {}", self.k);
        tracing::info!("  size = {}", self.size);
        tracing::info!("  canonical = {}", self.canonical);
        tracing::info!("  threads = {}", self.num_threads());
        tracing::info!("  output = {:?}", self.output);
        tracing::info!("  inputs = {}", self.inputs.len());
        if !self.prime_inputs.is_empty() {
            tracing::info!("  prime inputs = {}", self.prime_inputs.len());
        }
        tracing::debug!("  counter_len = {}", self.counter_len);
        tracing::debug!("  out_counter_len = {}", self.out_counter_len);
        tracing::debug!("  max_reprobe = {}", self.max_reprobe);
        tracing::debug!("  size_doubling = {} (max {:?})", self.size_doubling, self.max_size);
        tracing::debug!("  count range = {:?}", self.count_range());
        tracing::debug!("  bloom counter = {:?}", self.bloom_counter);
        tracing::debug!("  bloom filter = {:?} (fp {})", self.bf_size, self.bf_fp);
        tracing::debug!("  min_qual = {:?}", self.min_qual.map(char::from));
        tracing::debug!("  seed = {}", self.seed);
        tracing::debug!("  block_size = {} x {} per thread", self.block_size, self.buffers_per_thread);
    }
}

/// Parameters of a bloom counter building run
#[derive(Debug, Clone)]
pub struct BloomConfig {
    /// K-mer length (1..=31)
    pub k: usize,

    /// Insert canonical k-mers
    pub canonical: bool,

    /// Expected distinct k-mers
    pub size: u64,

    /// False-positive rate
    pub fp: f64,

    /// Worker threads (0 = all available cores)
    pub threads: usize,

    /// Snapshot path
    pub output: PathBuf,

    /// Sources to read
    pub inputs: Vec<RecordSource>,

    /// Quality bytes below this break k-mers
    pub min_qual: Option<u8>,

    /// Hash seed
    pub seed: u64,

    /// Bytes read per parser block
    pub block_size: usize,

    /// Parser buffers per worker thread
    pub buffers_per_thread: usize,

    /// Command line stored in the snapshot header
    pub cmdline: String,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            k: 21,
            canonical: false,
            size: 10_000_000,
            fp: DEFAULT_BF_FP,
            threads: 0,
            output: PathBuf::from("mer_counts.bc"),
            inputs: Vec::new(),
            min_qual: None,
            seed: DEFAULT_SEED,
            block_size: DEFAULT_BLOCK_SIZE,
            buffers_per_thread: DEFAULT_BUFFERS_PER_THREAD,
            cmdline: String::new(),
        }
    }
}

impl BloomConfig {
    /// Check the parameters
    pub fn validate(&self) -> Result<()> {
        if !is_valid_k(self.k) {
            return Err(CountError::Config(format!("k must be in range [{}, {}], got k={}", MIN_K, MAX_K, self.k)));
        }
        if self.size == 0 {
            return Err(CountError::Config("bloom counter size must be positive".to_string()));
        }
        if !(self.fp > 0.0 && self.fp < 1.0) {
            return Err(CountError::Config(format!("false positive rate must be in (0, 1), got {}", self.fp)));
        }
        if self.inputs.is_empty() {
            return Err(CountError::Config("no input to read".to_string()));
        }
        if self.block_size == 0 || self.buffers_per_thread == 0 {
            return Err(CountError::Config("block size and buffers per thread must be positive".to_string()));
        }
        Ok(())
    }

    /// Worker threads to start
    pub fn num_threads(&self) -> usize {
        threads_or_all(self.threads)
    }

    /// Log configuration parameters via tracing
    pub fn print(&self) {
        tracing::info!("Bloom Counter Configuration:");
        tracing::info!("  k = {}", self.k);
        tracing::info!("  size = {} (fp {})", self.size, self.fp);
        tracing::info!("  canonical = {}", self.canonical);
        tracing::info!("  threads = {}", self.num_threads());
        tracing::info!("  output = {:?}", self.output);
        tracing::debug!("  min_qual = {:?}", self.min_qual.map(char::from));
        tracing::debug!("  seed = {}", self.seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> Vec<RecordSource> {
        vec![RecordSource::File(PathBuf::from("reads.fa"))]
    }

    #[test]
    fn test_default_config_needs_inputs() {
        let config = CountConfig::default();
        assert!(config.validate().is_err());
        let config = CountConfig { inputs: inputs(), ..CountConfig::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_new_config() {
        let config = CountConfig::new(25, 1 << 16, inputs(), "out.kc").unwrap();
        assert_eq!(config.k, 25);
        assert_eq!(config.table_config().size, 1 << 16);
        assert_eq!(config.output_format(), OutputFormat::Binary { counter_bytes: DEFAULT_OUT_COUNTER_LEN });
    }

    #[test]
    fn test_validate_k() {
        assert!(CountConfig::new(0, 1024, inputs(), "o").is_err());
        assert!(CountConfig::new(32, 1024, inputs(), "o").is_err());
        assert!(CountConfig::new(31, 1024, inputs(), "o").is_ok());
    }

    #[test]
    fn test_validate_ranges() {
        let base = CountConfig { inputs: inputs(), ..CountConfig::default() };
        assert!(CountConfig { lower_count: Some(5), upper_count: Some(2), ..base.clone() }.validate().is_err());
        assert!(CountConfig { out_counter_len: 9, ..base.clone() }.validate().is_err());
        assert!(CountConfig { max_size: Some(10), ..base.clone() }.validate().is_err());
        assert!(CountConfig { bf_fp: 1.5, ..base.clone() }.validate().is_err());
        assert!(CountConfig { bf_size: Some(0), ..base.clone() }.validate().is_err());
        assert!(CountConfig { counter_len: 0, ..base }.validate().is_err());
    }

    #[test]
    fn test_quality_threshold() {
        assert_eq!(quality_threshold(None, None, 33).unwrap(), None);
        assert_eq!(quality_threshold(Some('5'), None, 33).unwrap(), Some(b'5'));
        assert_eq!(quality_threshold(None, Some(20), 33).unwrap(), Some(53));
        assert_eq!(quality_threshold(None, Some(20), 64).unwrap(), Some(84));
        assert!(quality_threshold(None, Some(100), 33).is_err());
        assert!(quality_threshold(Some(' '), None, 33).is_err());
        assert!(quality_threshold(Some('5'), Some(3), 33).is_err());
    }

    #[test]
    fn test_bloom_config() {
        let config = BloomConfig { inputs: inputs(), ..BloomConfig::default() };
        assert!(config.validate().is_ok());
        assert!(BloomConfig { fp: 0.0, ..config.clone() }.validate().is_err());
        assert!(BloomConfig { size: 0, ..config }.validate().is_err());
    }
}

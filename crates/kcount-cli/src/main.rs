use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use kcount_lib::counter::quality_threshold;
use kcount_lib::counter::config::DEFAULT_QUALITY_START;
use kcount_lib::{
    artifact_stats, build_bloom_counter, convert_artifact, count, histogram, merge_artifacts, BloomConfig,
    CountConfig, CountRange, MergeOptions, OutputFormat, RecordSource,
};
use std::path::PathBuf;
use tracing::{info, warn};

mod stats;

#[derive(Parser)]
#[command(name = "kcount")]
#[command(version = "0.1.0")]
#[command(about = "kcount: concurrent k-mer counting", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count k-mers in FASTA/FASTQ inputs
    Count(CountArgs),

    /// Build a bloom counter to skip k-mers seen only once
    Bc(BcArgs),

    /// Merge sorted count artifacts
    Merge {
        /// Output file
        #[arg(short, long, default_value = "mer_counts_merged.kc")]
        output: PathBuf,

        /// Write the output as text
        #[arg(long)]
        text: bool,

        /// Bytes per count in binary output
        #[arg(long, default_value = "4")]
        out_counter_len: u32,

        /// Don't output k-mers with count < lower-count
        #[arg(short = 'L', long)]
        lower_count: Option<u64>,

        /// Don't output k-mers with count > upper-count
        #[arg(short = 'U', long)]
        upper_count: Option<u64>,

        /// Artifacts to merge
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Convert an artifact to text (or binary)
    Dump {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Write binary records instead of text
        #[arg(long)]
        binary: bool,

        /// Bytes per count in binary output
        #[arg(long, default_value = "4")]
        out_counter_len: u32,

        /// Don't output k-mers with count < lower-count
        #[arg(short = 'L', long)]
        lower_count: Option<u64>,

        /// Don't output k-mers with count > upper-count
        #[arg(short = 'U', long)]
        upper_count: Option<u64>,

        /// Artifact to convert
        input: PathBuf,
    },

    /// Histogram of k-mer counts
    Histo {
        /// Low count value of histogram
        #[arg(short, long, default_value = "1")]
        low: u64,

        /// High count value of histogram
        #[arg(short = 'H', long, default_value = "10000")]
        high: u64,

        /// Increment value for buckets
        #[arg(short, long, default_value = "1")]
        increment: u64,

        /// Number of threads (0 = all available cores)
        #[arg(short = 't', long, default_value = "0")]
        threads: usize,

        /// Full histogram, including empty buckets
        #[arg(short, long)]
        full: bool,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Artifact to read
        input: PathBuf,
    },

    /// Statistics of an artifact
    Stats {
        /// Don't consider k-mers with count < lower-count
        #[arg(short = 'L', long)]
        lower_count: Option<u64>,

        /// Don't consider k-mers with count > upper-count
        #[arg(short = 'U', long)]
        upper_count: Option<u64>,

        /// Artifact to read
        input: PathBuf,
    },

    /// Print the header of an artifact
    Info {
        /// Artifact to read
        input: PathBuf,
    },
}

#[derive(Args)]
struct CountArgs {
    /// Length of mer
    #[arg(short = 'm', long = "mer-len")]
    mer_len: usize,

    /// Initial hash size (accepts k, M, G suffixes)
    #[arg(short, long, value_parser = parse_size)]
    size: usize,

    /// Number of threads (0 = all available cores)
    #[arg(short = 't', long, default_value = "0")]
    threads: usize,

    /// Output file
    #[arg(short, long, default_value = "mer_counts.kc")]
    output: PathBuf,

    /// Length bits of counting field
    #[arg(short = 'c', long, default_value = "7")]
    counter_len: u32,

    /// Length in bytes of counter field in output
    #[arg(long, default_value = "4")]
    out_counter_len: u32,

    /// Count both strand, canonical representation
    #[arg(short = 'C', long)]
    canonical: bool,

    /// Maximum number of reprobes
    #[arg(short = 'p', long, default_value = "126")]
    reprobes: usize,

    /// Dump in text format
    #[arg(long)]
    text: bool,

    /// Disk operation. Do not do size doubling
    #[arg(long)]
    disk: bool,

    /// Upper bound on the table size when doubling (accepts k, M, G suffixes)
    #[arg(long, value_parser = parse_size)]
    max_size: Option<usize>,

    /// Don't output k-mer with count < lower-count
    #[arg(short = 'L', long)]
    lower_count: Option<u64>,

    /// Don't output k-mer with count > upper-count
    #[arg(short = 'U', long)]
    upper_count: Option<u64>,

    /// Bloom counter to filter out singleton mers
    #[arg(long = "bc")]
    bloom_counter: Option<PathBuf>,

    /// Use bloom filter to count high-frequency mers (expected distinct mers)
    #[arg(long, value_parser = parse_size)]
    bf_size: Option<usize>,

    /// False positive rate of bloom filter
    #[arg(long, default_value = "0.01")]
    bf_fp: f64,

    /// Count only k-mers in these files
    #[arg(long = "if")]
    prime_inputs: Vec<PathBuf>,

    /// File of commands generating fast[aq]
    #[arg(short, long)]
    generator: Vec<PathBuf>,

    /// Shell used to run generators
    #[arg(long, default_value = "sh")]
    shell: String,

    /// Any base with quality below this character is changed to N
    #[arg(short = 'Q', long)]
    min_qual_char: Option<char>,

    /// Minimum Phred quality score
    #[arg(long)]
    min_quality: Option<u8>,

    /// ASCII for quality values
    #[arg(long, default_value_t = DEFAULT_QUALITY_START)]
    quality_start: u8,

    /// Print timing information to this file
    #[arg(long)]
    timing: Option<PathBuf>,

    /// Do not merge files intermediary files
    #[arg(long)]
    no_merge: bool,

    /// Do not unlink intermediary files after automatic merging
    #[arg(long)]
    no_unlink: bool,

    /// Don't write output
    #[arg(long)]
    no_write: bool,

    /// Bytes read per parser block (accepts k, M, G suffixes)
    #[arg(long, value_parser = parse_size)]
    block_size: Option<usize>,

    /// Sequence files, possibly gzipped, or named pipes
    inputs: Vec<PathBuf>,
}

#[derive(Args)]
struct BcArgs {
    /// Length of mer
    #[arg(short = 'm', long = "mer-len")]
    mer_len: usize,

    /// Expected number of distinct mers (accepts k, M, G suffixes)
    #[arg(short, long, value_parser = parse_size)]
    size: usize,

    /// False positive rate
    #[arg(short, long, default_value = "0.01")]
    fpr: f64,

    /// Number of threads (0 = all available cores)
    #[arg(short = 't', long, default_value = "0")]
    threads: usize,

    /// Output file
    #[arg(short, long, default_value = "mer_counts.bc")]
    output: PathBuf,

    /// Count both strand, canonical representation
    #[arg(short = 'C', long)]
    canonical: bool,

    /// File of commands generating fast[aq]
    #[arg(short, long)]
    generator: Vec<PathBuf>,

    /// Shell used to run generators
    #[arg(long, default_value = "sh")]
    shell: String,

    /// Any base with quality below this character is changed to N
    #[arg(short = 'Q', long)]
    min_qual_char: Option<char>,

    /// Minimum Phred quality score
    #[arg(long)]
    min_quality: Option<u8>,

    /// ASCII for quality values
    #[arg(long, default_value_t = DEFAULT_QUALITY_START)]
    quality_start: u8,

    /// Sequence files, possibly gzipped, or named pipes
    inputs: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing: use RUST_LOG if set, otherwise default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Count(args) => {
            count_command(args)?;
        }
        Commands::Bc(args) => {
            bc_command(args)?;
        }
        Commands::Merge { output, text, out_counter_len, lower_count, upper_count, inputs } => {
            let options = MergeOptions {
                format: output_format(!text, out_counter_len),
                range: CountRange::new(lower_count, upper_count),
                cmdline: cmdline(),
            };
            let result = merge_artifacts(&inputs, &output, &options)
                .with_context(|| format!("Failed to merge into {}", output.display()))?;
            info!("Merged {} artifacts: {} distinct k-mers, {} written", result.inputs, result.distinct, result.written);
        }
        Commands::Dump { output, binary, out_counter_len, lower_count, upper_count, input } => {
            let options = MergeOptions {
                format: output_format(binary, out_counter_len),
                range: CountRange::new(lower_count, upper_count),
                cmdline: cmdline(),
            };
            let result = convert_artifact(&input, &output, &options)
                .with_context(|| format!("Failed to convert {}", input.display()))?;
            info!("Wrote {} of {} k-mers to {}", result.written, result.distinct, output.display());
        }
        Commands::Histo { low, high, increment, threads, full, output, input } => {
            if threads > 0 {
                rayon::ThreadPoolBuilder::new().num_threads(threads).build_global()?;
            }
            let histo = histogram(&input, low, high, increment)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            stats::write_histogram(&histo, output.as_deref(), full)?;
        }
        Commands::Stats { lower_count, upper_count, input } => {
            let stats = artifact_stats(&input, CountRange::new(lower_count, upper_count))
                .with_context(|| format!("Failed to read {}", input.display()))?;
            stats::print_stats(&stats);
        }
        Commands::Info { input } => {
            stats::print_info(&input)?;
        }
    }

    Ok(())
}

fn count_command(args: CountArgs) -> anyhow::Result<()> {
    let mut inputs: Vec<RecordSource> = args.inputs.iter().map(RecordSource::from_path).collect();
    for generator in &args.generator {
        let commands = RecordSource::from_generator_file(generator, &args.shell)
            .with_context(|| format!("Failed to read generator file {}", generator.display()))?;
        inputs.extend(commands);
    }
    if inputs.is_empty() {
        bail!("no input: give sequence files or a generator file");
    }

    let mut config = CountConfig {
        k: args.mer_len,
        size: args.size,
        counter_len: args.counter_len,
        out_counter_len: args.out_counter_len,
        max_reprobe: args.reprobes,
        canonical: args.canonical,
        threads: args.threads,
        output: args.output,
        text: args.text,
        lower_count: args.lower_count,
        upper_count: args.upper_count,
        size_doubling: !args.disk,
        max_size: args.max_size,
        bloom_counter: args.bloom_counter,
        bf_size: args.bf_size.map(|n| n as u64),
        bf_fp: args.bf_fp,
        inputs,
        prime_inputs: args.prime_inputs.iter().map(RecordSource::from_path).collect(),
        min_qual: quality_threshold(args.min_qual_char, args.min_quality, args.quality_start)?,
        timing: args.timing,
        no_merge: args.no_merge,
        no_unlink: args.no_unlink,
        no_write: args.no_write,
        cmdline: cmdline(),
        ..CountConfig::default()
    };
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }

    let summary = count(&config)?;
    stats::print_pass("Counting", &summary.pass);
    if let Some(prime) = &summary.prime {
        stats::print_pass("Priming", prime);
    }
    match &summary.output {
        Some(path) => info!("Wrote {} k-mers to {}", summary.written, path.display()),
        None if !summary.intermediates.is_empty() => {
            for path in &summary.intermediates {
                info!("Intermediate: {}", path.display());
            }
        }
        None => {}
    }

    let failed = summary.pass.stream_errors.len() + summary.prime.as_ref().map_or(0, |p| p.stream_errors.len());
    if failed > 0 {
        bail!("{} input stream(s) failed", failed);
    }
    Ok(())
}

fn bc_command(args: BcArgs) -> anyhow::Result<()> {
    let mut inputs: Vec<RecordSource> = args.inputs.iter().map(RecordSource::from_path).collect();
    for generator in &args.generator {
        let commands = RecordSource::from_generator_file(generator, &args.shell)
            .with_context(|| format!("Failed to read generator file {}", generator.display()))?;
        inputs.extend(commands);
    }

    let config = BloomConfig {
        k: args.mer_len,
        canonical: args.canonical,
        size: args.size as u64,
        fp: args.fpr,
        threads: args.threads,
        output: args.output,
        inputs,
        min_qual: quality_threshold(args.min_qual_char, args.min_quality, args.quality_start)?,
        cmdline: cmdline(),
        ..BloomConfig::default()
    };
    let bc = build_bloom_counter(&config)?;
    info!("Saved bloom counter ({} cells) to {}", bc.size(), config.output.display());
    Ok(())
}

fn output_format(binary: bool, out_counter_len: u32) -> OutputFormat {
    if binary {
        OutputFormat::Binary { counter_bytes: out_counter_len }
    } else {
        OutputFormat::Text
    }
}

fn cmdline() -> String {
    std::env::args().collect::<Vec<_>>().join(" ")
}

/// Parse a size with an optional k, M or G suffix
fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 1usize << 10),
        Some((i, 'm' | 'M')) => (&s[..i], 1 << 20),
        Some((i, 'g' | 'G')) => (&s[..i], 1 << 30),
        _ => (s, 1),
    };
    let value: usize = digits.parse().map_err(|e| format!("invalid size {:?}: {}", s, e))?;
    value.checked_mul(multiplier).ok_or_else(|| format!("size {:?} is too large", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1000"), Ok(1000));
        assert_eq!(parse_size("4k"), Ok(4096));
        assert_eq!(parse_size("10M"), Ok(10 << 20));
        assert_eq!(parse_size("2G"), Ok(2 << 30));
        assert!(parse_size("M").is_err());
        assert!(parse_size("ten").is_err());
    }

    #[test]
    fn test_cli_parses_count() {
        let cli = Cli::try_parse_from([
            "kcount", "count", "-m", "21", "-s", "100M", "-C", "-L", "2", "--if", "primed.fa", "reads.fa",
        ])
        .unwrap();
        match cli.command {
            Commands::Count(args) => {
                assert_eq!(args.mer_len, 21);
                assert_eq!(args.size, 100 << 20);
                assert!(args.canonical);
                assert_eq!(args.lower_count, Some(2));
                assert_eq!(args.prime_inputs, vec![PathBuf::from("primed.fa")]);
                assert_eq!(args.inputs, vec![PathBuf::from("reads.fa")]);
            }
            _ => panic!("expected count"),
        }
    }
}

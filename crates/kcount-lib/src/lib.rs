// kcount: concurrent k-mer counting
//
// Counts the k-mers of FASTA/FASTQ streams in a shared lock-free table,
// writes sorted artifacts and merges them.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod constants;
pub mod error;
pub mod encoding;
pub mod hasher;
pub mod kmer;
pub mod serialization;
pub mod table;
pub mod bloom;
pub mod artifact;
pub mod dumper;
pub mod merge;
pub mod histo;
pub mod counter;

// Re-export common types at crate root
pub use error::{CountError, Result};
pub use kmer::Kmer;
pub use table::{CountingTable, HashCounter, TableConfig};
pub use bloom::{BloomCounter, BloomFilter};
pub use artifact::{ArtifactReader, ArtifactWriter};
pub use dumper::{CountRange, Dumper, OutputFormat};
pub use merge::{convert_artifact, merge_artifacts, MergeOptions, MergeResult};
pub use histo::{artifact_stats, histogram, ArtifactStats, Histogram};
pub use counter::{build_bloom_counter, count, count_with_cancel, BloomConfig, CancelToken, CountConfig, CountSummary, RecordSource};

/// Version information
pub fn version() -> (u8, u8, u8) {
    constants::VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let (major, minor, patch) = version();
        assert_eq!(major, 0);
        assert_eq!(minor, 1);
        assert_eq!(patch, 0);
    }
}

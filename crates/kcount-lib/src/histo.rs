//! Count histograms and summary statistics over artifacts
//!
//! Binary artifacts are scanned in parallel over the memory map; text
//! artifacts are read sequentially.

use std::io::Write;
use std::path::Path;

use rayon::prelude::*;

use crate::artifact::ArtifactReader;
use crate::dumper::CountRange;
use crate::error::{CountError, Result};
use crate::serialization::decode_record;

/// Records per parallel chunk
const CHUNK_RECORDS: usize = 1 << 16;

/// Run `fold` over every count of the artifact at `path` and combine the
/// partial results with `reduce`.
fn scan_counts<T, F, R>(path: &Path, identity: impl Fn() -> T + Sync + Send, fold: F, reduce: R) -> Result<T>
where
    T: Send,
    F: Fn(T, u64) -> T + Sync + Send,
    R: Fn(T, T) -> T + Sync + Send,
{
    let mut reader = ArtifactReader::open(path)?;
    let header = reader.header().clone();
    if let Some(records) = reader.binary_records() {
        let key_bytes = header.key_bytes();
        let counter_bytes = header.counter_bytes as usize;
        let record_len = header.record_len();
        let result = records
            .par_chunks(record_len * CHUNK_RECORDS)
            .fold(&identity, |acc, chunk| {
                chunk
                    .chunks_exact(record_len)
                    .map(|record| decode_record(record, key_bytes, counter_bytes).1)
                    .fold(acc, &fold)
            })
            .reduce(&identity, &reduce);
        return Ok(result);
    }
    let mut acc = identity();
    while let Some((_, count)) = reader.next_entry()? {
        acc = fold(acc, count);
    }
    Ok(acc)
}

/// Histogram of counts in fixed-width buckets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Histogram {
    base: u64,
    increment: u64,
    buckets: Vec<u64>,
}

/// Upper bound on the number of buckets; each scanning thread holds a copy
const MAX_BUCKETS: u64 = 1 << 22;

impl Histogram {
    /// Empty histogram from `low` to `high` in steps of `increment`. The
    /// first bucket collects counts below `low - increment` and the last
    /// counts above `high + increment`.
    pub fn new(low: u64, high: u64, increment: u64) -> Result<Self> {
        if increment == 0 {
            return Err(CountError::Config("histogram increment must be positive".to_string()));
        }
        if low > high {
            return Err(CountError::Config(format!("histogram low {} is above high {}", low, high)));
        }
        let base = low.saturating_sub(increment);
        let ceil = high.saturating_add(increment);
        let steps = (ceil - base) / increment;
        if steps >= MAX_BUCKETS {
            return Err(CountError::Config(format!(
                "histogram from {} to {} by {} needs more than {} buckets",
                low, high, increment, MAX_BUCKETS
            )));
        }
        Ok(Self { base, increment, buckets: vec![0; steps as usize + 1] })
    }

    #[inline]
    fn index(&self, count: u64) -> usize {
        let last = self.buckets.len() - 1;
        if count < self.base {
            0
        } else {
            (((count - self.base) / self.increment) as usize).min(last)
        }
    }

    /// Add one k-mer with `count`
    #[inline]
    pub fn add(&mut self, count: u64) {
        let idx = self.index(count);
        self.buckets[idx] += 1;
    }

    /// Add the buckets of `other`, built with the same bounds
    pub fn merge(mut self, other: Histogram) -> Self {
        for (a, b) in self.buckets.iter_mut().zip(other.buckets) {
            *a += b;
        }
        self
    }

    /// `(bucket value, k-mers)` rows, empty buckets included
    pub fn rows(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.buckets.iter().enumerate().map(|(i, &n)| (self.base + i as u64 * self.increment, n))
    }

    /// Write `value count` lines, skipping empty buckets unless `full`
    pub fn write_to<W: Write>(&self, out: &mut W, full: bool) -> Result<()> {
        for (value, n) in self.rows().filter(|&(_, n)| full || n > 0) {
            writeln!(out, "{} {}", value, n)?;
        }
        Ok(())
    }
}

/// Histogram of the counts of the artifact at `path`
pub fn histogram<P: AsRef<Path>>(path: P, low: u64, high: u64, increment: u64) -> Result<Histogram> {
    let empty = Histogram::new(low, high, increment)?;
    scan_counts(
        path.as_ref(),
        || empty.clone(),
        |mut histo, count| {
            histo.add(count);
            histo
        },
        Histogram::merge,
    )
}

/// Summary figures of an artifact
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArtifactStats {
    /// K-mers seen exactly once
    pub unique: u64,
    /// Distinct k-mers
    pub distinct: u64,
    /// Sum of counts
    pub total: u64,
    /// Largest count
    pub max_count: u64,
}

impl ArtifactStats {
    #[inline]
    fn add(mut self, count: u64) -> Self {
        self.unique += (count == 1) as u64;
        self.distinct += 1;
        self.total = self.total.saturating_add(count);
        self.max_count = self.max_count.max(count);
        self
    }

    fn merge(self, other: Self) -> Self {
        Self {
            unique: self.unique + other.unique,
            distinct: self.distinct + other.distinct,
            total: self.total.saturating_add(other.total),
            max_count: self.max_count.max(other.max_count),
        }
    }
}

/// Statistics over the counts of `path` that fall in `range`
pub fn artifact_stats<P: AsRef<Path>>(path: P, range: CountRange) -> Result<ArtifactStats> {
    scan_counts(
        path.as_ref(),
        ArtifactStats::default,
        |stats, count| if range.contains(count) { stats.add(count) } else { stats },
        ArtifactStats::merge,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactWriter;
    use crate::serialization::{ArtifactHeader, FormatTag};
    use tempfile::TempDir;

    fn write(path: &Path, format: FormatTag, counts: &[u64]) {
        let mut writer = ArtifactWriter::create(path, ArtifactHeader::dump(format, 8, 4, false)).unwrap();
        for (key, &count) in counts.iter().enumerate() {
            writer.write(key as u64, count).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_bucket_bounds() {
        let mut histo = Histogram::new(2, 5, 1).unwrap();
        for count in [1, 2, 2, 5, 6, 7, 100] {
            histo.add(count);
        }
        let rows: Vec<_> = histo.rows().collect();
        assert_eq!(rows, vec![(1, 1), (2, 2), (3, 0), (4, 0), (5, 1), (6, 3)]);
    }

    #[test]
    fn test_increment_buckets() {
        let mut histo = Histogram::new(1, 10, 3).unwrap();
        for count in [1, 2, 3, 4, 12, 13, 50] {
            histo.add(count);
        }
        let mut out = Vec::new();
        histo.write_to(&mut out, false).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "0 2\n3 2\n12 3\n");
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(Histogram::new(1, 10, 0).is_err());
        assert!(Histogram::new(10, 1, 1).is_err());
        assert!(matches!(Histogram::new(1, u64::MAX, 1), Err(CountError::Config(_))));
        assert!(Histogram::new(1, u64::MAX, u64::MAX / 4).is_ok());
    }

    #[test]
    fn test_binary_and_text_histograms_agree() {
        let dir = TempDir::new().unwrap();
        let counts: Vec<u64> = (0..200_000u64).map(|i| i % 13 + 1).collect();
        let bin = dir.path().join("bin");
        let txt = dir.path().join("txt");
        write(&bin, FormatTag::Binary, &counts);
        write(&txt, FormatTag::Text, &counts);

        let a = histogram(&bin, 1, 10, 1).unwrap();
        let b = histogram(&txt, 1, 10, 1).unwrap();
        assert_eq!(a, b);
        let total: u64 = a.rows().map(|(_, n)| n).sum();
        assert_eq!(total, 200_000);
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bin");
        write(&path, FormatTag::Binary, &[1, 1, 4, 9, 2]);
        let stats = artifact_stats(&path, CountRange::default()).unwrap();
        assert_eq!(stats, ArtifactStats { unique: 2, distinct: 5, total: 17, max_count: 9 });
        let bounded = artifact_stats(&path, CountRange::new(Some(2), Some(4))).unwrap();
        assert_eq!(bounded, ArtifactStats { unique: 0, distinct: 2, total: 6, max_count: 4 });
    }
}

//! K-way merge of sorted artifacts
//!
//! 1. Every input header is checked against the first (key length,
//!    canonical flag); a mismatch fails the whole merge and names the file.
//! 2. Inputs are merged in key order: linear scan for ≤16 inputs, a
//!    tournament tree above that.
//! 3. Counts of equal keys are summed and totals outside the count range
//!    are dropped before writing.
//!
//! Inputs are never deleted here; the caller decides once the merge has
//! succeeded.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info};

use crate::artifact::{ArtifactReader, ArtifactWriter};
use crate::dumper::{CountRange, OutputFormat};
use crate::error::{CountError, Result};

/// Options of a merge or conversion
#[derive(Clone, Debug)]
pub struct MergeOptions {
    /// Encoding of the output
    pub format: OutputFormat,
    /// Totals kept in the output
    pub range: CountRange,
    /// Command line recorded in the output header
    pub cmdline: String,
}

/// Result of merge operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeResult {
    /// Number of input artifacts
    pub inputs: usize,
    /// Distinct keys across the inputs
    pub distinct: u64,
    /// Records written after range filtering
    pub written: u64,
}

const NONE: u32 = u32::MAX;

/// Merges sorted readers into one key-ordered stream
struct MergingIterator {
    readers: Vec<ArtifactReader>,
    heads: Vec<Option<(u64, u64)>>,
    /// Tournament tree (only used for >16 inputs); node 1 is the root
    tree: Vec<u32>,
    leaves: usize,
}

impl MergingIterator {
    const SCAN_THRESHOLD: usize = 16;

    fn new(mut readers: Vec<ArtifactReader>) -> Result<Self> {
        let heads = readers.iter_mut().map(|r| r.next_entry()).collect::<Result<Vec<_>>>()?;
        let mut merger = Self { readers, heads, tree: Vec::new(), leaves: 0 };

        let n = merger.readers.len();
        if n > Self::SCAN_THRESHOLD {
            merger.leaves = n.next_power_of_two();
            merger.tree = vec![NONE; 2 * merger.leaves];
            for i in 0..n {
                merger.tree[merger.leaves + i] = i as u32;
            }
            for p in (1..merger.leaves).rev() {
                merger.tree[p] = merger.winner(merger.tree[2 * p], merger.tree[2 * p + 1]);
            }
        }
        Ok(merger)
    }

    #[inline]
    fn head_key(&self, idx: u32) -> Option<u64> {
        if idx == NONE {
            None
        } else {
            self.heads[idx as usize].map(|(key, _)| key)
        }
    }

    /// Input with the smaller head; exhausted inputs lose, ties go left.
    #[inline]
    fn winner(&self, left: u32, right: u32) -> u32 {
        match (self.head_key(left), self.head_key(right)) {
            (None, _) => right,
            (Some(_), None) => left,
            (Some(l), Some(r)) => {
                if r < l {
                    right
                } else {
                    left
                }
            }
        }
    }

    fn min_index(&self) -> Option<usize> {
        if self.tree.is_empty() {
            self.heads
                .iter()
                .enumerate()
                .filter_map(|(i, head)| head.map(|(key, _)| (key, i)))
                .min()
                .map(|(_, i)| i)
        } else {
            let root = self.tree[1];
            self.head_key(root).map(|_| root as usize)
        }
    }

    fn next(&mut self) -> Result<Option<(u64, u64)>> {
        let Some(idx) = self.min_index() else {
            return Ok(None);
        };
        let entry = self.heads[idx];
        self.heads[idx] = self.readers[idx].next_entry()?;

        if !self.tree.is_empty() {
            let mut p = (self.leaves + idx) / 2;
            while p >= 1 {
                self.tree[p] = self.winner(self.tree[2 * p], self.tree[2 * p + 1]);
                p /= 2;
            }
        }
        Ok(entry)
    }
}

fn open_compatible(inputs: &[PathBuf]) -> Result<Vec<ArtifactReader>> {
    let mut readers: Vec<ArtifactReader> = Vec::with_capacity(inputs.len());
    for path in inputs {
        let reader = ArtifactReader::open(path).map_err(|e| CountError::Merge {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if let Some(first) = readers.first() {
            let (a, b) = (first.header(), reader.header());
            if a.key_len != b.key_len {
                return Err(CountError::Merge {
                    path: path.clone(),
                    reason: format!(
                        "key length {} bits differs from {} bits in {:?}",
                        b.key_len,
                        a.key_len,
                        first.path()
                    ),
                });
            }
            if a.canonical != b.canonical {
                return Err(CountError::Merge {
                    path: path.clone(),
                    reason: format!(
                        "canonical={} differs from canonical={} in {:?}",
                        b.canonical,
                        a.canonical,
                        first.path()
                    ),
                });
            }
        }
        readers.push(reader);
    }
    Ok(readers)
}

/// Inputs are memory-mapped while the output is written, so the output
/// must not be one of them.
fn reject_aliased_output(inputs: &[PathBuf], output: &Path) -> Result<()> {
    let Ok(target) = std::fs::canonicalize(output) else {
        return Ok(());
    };
    for input in inputs {
        if std::fs::canonicalize(input).is_ok_and(|path| path == target) {
            return Err(CountError::Merge {
                path: input.clone(),
                reason: "input is also the merge output".to_string(),
            });
        }
    }
    Ok(())
}

/// Merge sorted artifacts into `output`, summing counts of equal keys
pub fn merge_artifacts<P: AsRef<Path>>(inputs: &[PathBuf], output: P, options: &MergeOptions) -> Result<MergeResult> {
    let output = output.as_ref();
    if inputs.is_empty() {
        return Err(CountError::Config("no artifacts to merge".to_string()));
    }
    reject_aliased_output(inputs, output)?;
    let start = Instant::now();
    let readers = open_compatible(inputs)?;
    let first = readers[0].header();
    let mut header = options.format.header(first.k(), first.canonical);
    header.seeds = first.seeds;
    header.size = first.size;
    header.max_reprobe = first.max_reprobe;
    header.cmdline = options.cmdline.clone();

    info!("Merging {} artifacts into {:?}", inputs.len(), output);
    let mut merger = MergingIterator::new(readers)?;
    let mut writer = ArtifactWriter::create(output, header)?;
    let mut distinct = 0u64;
    let mut current: Option<(u64, u64)> = None;

    while let Some((key, count)) = merger.next()? {
        if let Some((k, c)) = current.as_mut() {
            if *k == key {
                *c = c.saturating_add(count);
                continue;
            }
        }
        if let Some((k, c)) = current.replace((key, count)) {
            distinct += 1;
            if options.range.contains(c) {
                writer.write(k, c)?;
            }
        }
    }
    if let Some((k, c)) = current {
        distinct += 1;
        if options.range.contains(c) {
            writer.write(k, c)?;
        }
    }
    let written = writer.finish()?;

    debug!("Merge of {} keys took {:?}", distinct, start.elapsed());
    Ok(MergeResult { inputs: inputs.len(), distinct, written })
}

/// Rewrite one artifact in `options.format`, keeping counts in range
pub fn convert_artifact<P: AsRef<Path>>(input: &Path, output: P, options: &MergeOptions) -> Result<MergeResult> {
    merge_artifacts(&[input.to_path_buf()], output, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::{ArtifactHeader, FormatTag};
    use tempfile::TempDir;

    fn write_artifact(path: &Path, k: usize, canonical: bool, records: &[(u64, u64)]) {
        let header = ArtifactHeader::dump(FormatTag::Binary, k, 8, canonical);
        let mut writer = ArtifactWriter::create(path, header).unwrap();
        for &(key, count) in records {
            writer.write(key, count).unwrap();
        }
        writer.finish().unwrap();
    }

    fn read_all(path: &Path) -> Vec<(u64, u64)> {
        let mut reader = ArtifactReader::open(path).unwrap();
        let mut out = Vec::new();
        while let Some(entry) = reader.next_entry().unwrap() {
            out.push(entry);
        }
        out
    }

    fn options(range: CountRange) -> MergeOptions {
        MergeOptions { format: OutputFormat::Binary { counter_bytes: 4 }, range, cmdline: String::new() }
    }

    #[test]
    fn test_merge_sums_equal_keys() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_artifact(&a, 5, true, &[(1, 2), (4, 1), (9, 3)]);
        write_artifact(&b, 5, true, &[(1, 1), (5, 7), (9, 1)]);

        let out = dir.path().join("out");
        let result = merge_artifacts(&[a, b], &out, &options(CountRange::default())).unwrap();
        assert_eq!(result, MergeResult { inputs: 2, distinct: 4, written: 4 });
        assert_eq!(read_all(&out), vec![(1, 3), (4, 1), (5, 7), (9, 4)]);
    }

    #[test]
    fn test_merge_range_filter_drops_outside_totals() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_artifact(&a, 5, false, &[(1, 1), (2, 5), (3, 1)]);
        write_artifact(&b, 5, false, &[(1, 1), (3, 9)]);

        let out = dir.path().join("out");
        let result = merge_artifacts(&[a, b], &out, &options(CountRange::new(Some(2), Some(6)))).unwrap();
        assert_eq!(result.distinct, 3);
        assert_eq!(read_all(&out), vec![(1, 2), (2, 5)]);
    }

    #[test]
    fn test_merge_many_inputs_uses_tree() {
        let dir = TempDir::new().unwrap();
        let mut inputs = Vec::new();
        for i in 0..37u64 {
            let path = dir.path().join(format!("part_{}", i));
            let records: Vec<(u64, u64)> = (0..20u64).map(|j| (j * 37 + i, 1)).chain([(5000, 1)]).collect();
            write_artifact(&path, 7, true, &records);
            inputs.push(path);
        }
        let out = dir.path().join("out");
        let result = merge_artifacts(&inputs, &out, &options(CountRange::default())).unwrap();
        assert_eq!(result.distinct, 37 * 20 + 1);

        let merged = read_all(&out);
        assert!(merged.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(merged.last(), Some(&(5000, 37)));
        assert!(merged[..merged.len() - 1].iter().all(|&(_, c)| c == 1));
    }

    #[test]
    fn test_merge_rejects_incompatible_headers() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        write_artifact(&a, 5, true, &[(1, 1)]);
        write_artifact(&b, 6, true, &[(1, 1)]);
        write_artifact(&c, 5, false, &[(1, 1)]);

        let out = dir.path().join("out");
        match merge_artifacts(&[a.clone(), b.clone()], &out, &options(CountRange::default())) {
            Err(CountError::Merge { path, .. }) => assert_eq!(path, b),
            other => panic!("expected merge error, got {:?}", other),
        }
        match merge_artifacts(&[a, c.clone()], &out, &options(CountRange::default())) {
            Err(CountError::Merge { path, reason }) => {
                assert_eq!(path, c);
                assert!(reason.contains("canonical"));
            }
            other => panic!("expected merge error, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_refuses_to_overwrite_an_input() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_artifact(&a, 5, false, &[(1, 2), (4, 1)]);
        write_artifact(&b, 5, false, &[(1, 3)]);

        let aliased = dir.path().join(".").join("a");
        match merge_artifacts(&[a.clone(), b], &aliased, &options(CountRange::default())) {
            Err(CountError::Merge { path, reason }) => {
                assert_eq!(path, a);
                assert!(reason.contains("output"));
            }
            other => panic!("expected merge error, got {:?}", other),
        }
        assert_eq!(read_all(&a), vec![(1, 2), (4, 1)]);
    }

    #[test]
    fn test_convert_rejects_oversized_key() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("wide");
        let mut header = ArtifactHeader::dump(FormatTag::Binary, 31, 8, false);
        header.key_len = 64;
        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();
        bytes.extend_from_slice(&[0u8; 16]);
        std::fs::write(&input, &bytes).unwrap();

        let options = MergeOptions { format: OutputFormat::Text, ..options(CountRange::default()) };
        assert!(convert_artifact(&input, dir.path().join("wide.txt"), &options).is_err());
    }

    #[test]
    fn test_merge_missing_input() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        let result = merge_artifacts(&[missing.clone()], dir.path().join("out"), &options(CountRange::default()));
        assert!(matches!(result, Err(CountError::Merge { path, .. }) if path == missing));
    }

    #[test]
    fn test_convert_to_text() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        write_artifact(&a, 2, false, &[(0b0001, 4), (0b1110, 1)]);
        let out = dir.path().join("a.txt");
        let opts = MergeOptions { format: OutputFormat::Text, range: CountRange::default(), cmdline: String::new() };
        convert_artifact(&a, &out, &opts).unwrap();
        let reader = ArtifactReader::open(&out).unwrap();
        assert_eq!(reader.header().format, FormatTag::Text);
        assert_eq!(read_all(&out), vec![(0b0001, 4), (0b1110, 1)]);
    }
}

//! Rolling k-mer extraction from sequence records
//!
//! The forward and reverse-complement windows are updated one base at a
//! time. A base outside ACGT (or under the quality threshold) restarts the
//! window, so no emitted k-mer spans it.

use crate::encoding::{CODES, INVALID_CODE};
use crate::kmer::{kmer_mask, Kmer};

/// Extracts k-mers from records
#[derive(Clone, Copy, Debug)]
pub struct MerExtractor {
    k: usize,
    canonical: bool,
    min_qual: Option<u8>,
    mask: u64,
    rc_shift: u32,
}

impl MerExtractor {
    /// Extractor of `k`-mers. In canonical mode each window yields the
    /// smaller of itself and its reverse complement, and palindromes are
    /// skipped. Quality bytes below `min_qual` act as invalid bases.
    pub fn new(k: usize, canonical: bool, min_qual: Option<u8>) -> Self {
        Self { k, canonical, min_qual, mask: kmer_mask(k), rc_shift: 2 * (k as u32 - 1) }
    }

    /// K-mer length
    pub fn k(&self) -> usize {
        self.k
    }

    /// Whether keys are canonical
    pub fn canonical(&self) -> bool {
        self.canonical
    }

    /// K-mers of `seq`, with `qual` checked when a threshold is set
    pub fn mers<'a>(&'a self, seq: &'a [u8], qual: Option<&'a [u8]>) -> MerIter<'a> {
        MerIter { extractor: self, seq, qual, pos: 0, fwd: 0, rev: 0, filled: 0 }
    }
}

/// Iterator over the k-mers of one record
pub struct MerIter<'a> {
    extractor: &'a MerExtractor,
    seq: &'a [u8],
    qual: Option<&'a [u8]>,
    pos: usize,
    fwd: u64,
    rev: u64,
    filled: usize,
}

impl MerIter<'_> {
    #[inline]
    fn low_quality(&self, i: usize) -> bool {
        match (self.extractor.min_qual, self.qual) {
            (Some(min), Some(qual)) => qual.get(i).map_or(true, |&q| q < min),
            _ => false,
        }
    }
}

impl Iterator for MerIter<'_> {
    type Item = Kmer;

    fn next(&mut self) -> Option<Kmer> {
        let ex = self.extractor;
        while self.pos < self.seq.len() {
            let i = self.pos;
            self.pos += 1;

            let code = CODES[self.seq[i] as usize];
            if code == INVALID_CODE || self.low_quality(i) {
                self.filled = 0;
                continue;
            }
            self.fwd = ((self.fwd << 2) | code as u64) & ex.mask;
            self.rev = (self.rev >> 2) | ((3 - code) as u64) << ex.rc_shift;
            if self.filled < ex.k {
                self.filled += 1;
            }
            if self.filled < ex.k {
                continue;
            }

            if !ex.canonical {
                return Some(Kmer::new(self.fwd, ex.k));
            }
            if self.fwd == self.rev {
                continue;
            }
            return Some(Kmer::new(self.fwd.min(self.rev), ex.k));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(ex: &MerExtractor, seq: &[u8], qual: Option<&[u8]>) -> Vec<String> {
        ex.mers(seq, qual).map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_forward_windows() {
        let ex = MerExtractor::new(3, false, None);
        assert_eq!(strings(&ex, b"ACGTACG", None), vec!["ACG", "CGT", "GTA", "TAC", "ACG"]);
    }

    #[test]
    fn test_canonical_windows() {
        let ex = MerExtractor::new(3, true, None);
        assert_eq!(strings(&ex, b"ACGTACG", None), vec!["ACG", "ACG", "GTA", "GTA", "ACG"]);
    }

    #[test]
    fn test_invalid_base_resets_window() {
        let ex = MerExtractor::new(3, false, None);
        assert_eq!(strings(&ex, b"ACNGTA", None), vec!["GTA"]);
        assert_eq!(strings(&ex, b"acgtn", None), vec!["ACG", "CGT"]);
        assert!(strings(&ex, b"AC", None).is_empty());
    }

    #[test]
    fn test_canonical_skips_palindromes() {
        let ex = MerExtractor::new(4, true, None);
        // ACGT is its own reverse complement; CGTA is not
        assert_eq!(strings(&ex, b"ACGTA", None), vec!["CGTA"]);
        let forward = MerExtractor::new(4, false, None);
        assert_eq!(strings(&forward, b"ACGT", None), vec!["ACGT"]);
    }

    #[test]
    fn test_quality_threshold() {
        let ex = MerExtractor::new(2, false, Some(b'5'));
        assert_eq!(strings(&ex, b"ACGTA", Some(b"II#II")), vec!["AC", "TA"]);
        assert_eq!(strings(&ex, b"ACGTA", None), vec!["AC", "CG", "GT", "TA"]);
        let lax = MerExtractor::new(2, false, None);
        assert_eq!(strings(&lax, b"ACG", Some(b"###")), vec!["AC", "CG"]);
    }

    #[test]
    fn test_matches_kmer_canonical() {
        let ex = MerExtractor::new(21, true, None);
        let seq = b"TTGACCAGTACGGATCCAGTTGCAAGGCTTACAGTTACA";
        let fwd = MerExtractor::new(21, false, None);
        for (c, f) in ex.mers(seq, None).zip(fwd.mers(seq, None)) {
            assert_eq!(c, f.canonical());
        }
        assert_eq!(ex.mers(seq, None).count(), seq.len() - 20);
    }
}

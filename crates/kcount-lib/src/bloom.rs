//! Bloom prefilters
//!
//! - [`BloomCounter`]: 2-bit saturating cells. `check` returns the minimum
//!   over the probed cells, a lower bound (capped at 3) on how many times
//!   the key was inserted. Built in a separate pass, saved as a
//!   `bloomcounter` artifact and loaded read-only by the counting pass.
//! - [`BloomFilter`]: one bit per position. `insert` sets all probed bits
//!   with `fetch_or` and reports whether they were all set already.
//!
//! Both probe `nb_hashes` positions by double hashing `h1 + i * h2`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::error::{CountError, Result};
use crate::hasher::DeterministicHasher;
use crate::serialization::{ArtifactHeader, FormatTag};

/// Bits per bloom counter cell
const CELL_BITS: u64 = 2;
/// Cells per word
const CELLS_PER_WORD: u64 = 64 / CELL_BITS;
/// Largest value a cell holds
const CELL_MAX: u64 = (1 << CELL_BITS) - 1;

/// Number of bits and hash functions for `n` elements at false-positive rate `fp`
pub fn optimal_parameters(fp: f64, n: u64) -> (u64, u32) {
    let n = n.max(1) as f64;
    let ln2 = std::f64::consts::LN_2;
    let m = (-n * fp.ln() / (ln2 * ln2)).ceil().max(64.0);
    let k = ((m / n) * ln2).round().max(1.0);
    (m as u64, k as u32)
}

#[derive(Clone, Debug)]
struct Probes {
    h1: DeterministicHasher,
    h2: DeterministicHasher,
    nb_hashes: u32,
    size: u64,
}

impl Probes {
    fn new(seeds: [u64; 2], nb_hashes: u32, size: u64) -> Self {
        Self { h1: DeterministicHasher::new(seeds[0]), h2: DeterministicHasher::new(seeds[1]), nb_hashes, size }
    }

    #[inline]
    fn positions(&self, key: u64) -> impl Iterator<Item = u64> + '_ {
        let a = self.h1.hash_u64(key);
        // Odd step so consecutive probes never coincide
        let b = self.h2.hash_u64(key) | 1;
        (0..self.nb_hashes as u64).map(move |i| a.wrapping_add(i.wrapping_mul(b)) % self.size)
    }

    fn seeds(&self) -> [u64; 2] {
        [self.h1.seed(), self.h2.seed()]
    }
}

/// Array of 2-bit saturating counters
pub struct BloomCounter {
    words: Box<[AtomicU64]>,
    probes: Probes,
    k: usize,
}

impl BloomCounter {
    /// Counter sized for `n` distinct keys at false-positive rate `fp`
    pub fn new(fp: f64, n: u64, k: usize, seed: u64) -> Self {
        let (size, nb_hashes) = optimal_parameters(fp, n);
        Self::with_size(size, nb_hashes, k, [seed, seed.wrapping_add(0x9E37_79B9_7F4A_7C15)])
    }

    /// Counter of `size` cells and `nb_hashes` probes
    pub fn with_size(size: u64, nb_hashes: u32, k: usize, seeds: [u64; 2]) -> Self {
        let size = size.max(1);
        let nb_words = size.div_ceil(CELLS_PER_WORD) as usize;
        Self {
            words: (0..nb_words).map(|_| AtomicU64::new(0)).collect(),
            probes: Probes::new(seeds, nb_hashes.max(1), size),
            k,
        }
    }

    /// Number of cells
    pub fn size(&self) -> u64 {
        self.probes.size
    }

    /// Number of probes per key
    pub fn nb_hashes(&self) -> u32 {
        self.probes.nb_hashes
    }

    /// K-mer length the counter was built for
    pub fn k(&self) -> usize {
        self.k
    }

    #[inline]
    fn cell(&self, pos: u64) -> (&AtomicU64, u64) {
        (&self.words[(pos / CELLS_PER_WORD) as usize], (pos % CELLS_PER_WORD) * CELL_BITS)
    }

    /// Count one occurrence of `key`; returns the previous lower bound.
    pub fn insert(&self, key: u64) -> u8 {
        let mut previous = CELL_MAX;
        for pos in self.probes.positions(key) {
            let (word, shift) = self.cell(pos);
            let mut current = word.load(Ordering::Relaxed);
            loop {
                let value = (current >> shift) & CELL_MAX;
                if value == CELL_MAX {
                    break;
                }
                let next = current + (1 << shift);
                match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
            previous = previous.min((current >> shift) & CELL_MAX);
        }
        previous as u8
    }

    /// Lower bound on the number of insertions of `key`, capped at 3
    pub fn check(&self, key: u64) -> u8 {
        self.probes
            .positions(key)
            .map(|pos| {
                let (word, shift) = self.cell(pos);
                (word.load(Ordering::Acquire) >> shift) & CELL_MAX
            })
            .min()
            .unwrap_or(0) as u8
    }

    /// Snapshot header
    pub fn header(&self, canonical: bool, cmdline: &str) -> ArtifactHeader {
        let mut header = ArtifactHeader::dump(FormatTag::BloomCounter, self.k, 0, canonical);
        header.seeds = self.probes.seeds();
        header.size = self.probes.size;
        header.nb_hashes = self.probes.nb_hashes;
        header.cmdline = cmdline.to_string();
        header
    }

    /// Write a `bloomcounter` snapshot
    pub fn save<P: AsRef<Path>>(&self, path: P, canonical: bool, cmdline: &str) -> Result<()> {
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        self.header(canonical, cmdline).write(&mut out)?;
        for word in self.words.iter() {
            out.write_all(&word.load(Ordering::Acquire).to_le_bytes())?;
        }
        out.flush()?;
        info!("Saved bloom counter ({} cells, {} hashes) to {:?}", self.size(), self.nb_hashes(), path.as_ref());
        Ok(())
    }

    /// Load a snapshot for a run counting `k`-mers. Fails unless the file
    /// is a complete `bloomcounter` artifact for the same k and the same
    /// canonical mode.
    pub fn load<P: AsRef<Path>>(path: P, k: usize, canonical: bool) -> Result<Self> {
        let path = path.as_ref();
        let bad = |reason: String| CountError::BloomFormat { path: path.to_path_buf(), reason };

        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let header = ArtifactHeader::read(&mut reader).map_err(|e| bad(e.to_string()))?;
        if header.format != FormatTag::BloomCounter {
            return Err(bad(format!("format is {}, expected {}", header.format.name(), FormatTag::BloomCounter.name())));
        }
        if header.key_len as usize != 2 * k {
            return Err(bad(format!("key length is {} bits, this run uses {} bits", header.key_len, 2 * k)));
        }
        if header.canonical != canonical {
            return Err(bad(format!("built with canonical = {}, this run uses canonical = {}", header.canonical, canonical)));
        }
        if header.size == 0 || header.nb_hashes == 0 {
            return Err(bad(format!("{} cells, {} hash functions", header.size, header.nb_hashes)));
        }

        // Body length must match the header before anything is allocated
        let nb_words = header.size.div_ceil(CELLS_PER_WORD);
        let expected = nb_words.saturating_mul(8);
        let body_len = file_len.saturating_sub(reader.stream_position()?);
        if body_len < expected {
            return Err(bad(format!("truncated: {} of {} body bytes", body_len, expected)));
        }
        if body_len > expected {
            return Err(bad(format!("trailing data: {} body bytes, expected {}", body_len, expected)));
        }

        let nb_words = nb_words as usize;
        let mut words = Vec::with_capacity(nb_words);
        let mut bytes = [0u8; 8];
        for i in 0..nb_words {
            reader
                .read_exact(&mut bytes)
                .map_err(|_| bad(format!("truncated after {} of {} words", i, nb_words)))?;
            words.push(AtomicU64::new(u64::from_le_bytes(bytes)));
        }

        debug!("Loaded bloom counter {:?}: {} cells, {} hashes", path, header.size, header.nb_hashes);
        Ok(Self {
            words: words.into_boxed_slice(),
            probes: Probes::new(header.seeds, header.nb_hashes, header.size),
            k,
        })
    }
}

/// Bit array with atomic insertion
pub struct BloomFilter {
    words: Box<[AtomicU64]>,
    probes: Probes,
}

impl BloomFilter {
    /// Filter sized for `n` distinct keys at false-positive rate `fp`
    pub fn new(fp: f64, n: u64, seed: u64) -> Self {
        let (size, nb_hashes) = optimal_parameters(fp, n);
        let nb_words = size.div_ceil(64) as usize;
        Self {
            words: (0..nb_words).map(|_| AtomicU64::new(0)).collect(),
            probes: Probes::new([seed, seed.wrapping_add(0x9E37_79B9_7F4A_7C15)], nb_hashes, size),
        }
    }

    /// Number of bits
    pub fn size(&self) -> u64 {
        self.probes.size
    }

    /// Number of probes per key
    pub fn nb_hashes(&self) -> u32 {
        self.probes.nb_hashes
    }

    /// Set the bits of `key`; true if every one was already set.
    pub fn insert(&self, key: u64) -> bool {
        let mut present = true;
        for pos in self.probes.positions(key) {
            let bit = 1u64 << (pos % 64);
            let previous = self.words[(pos / 64) as usize].fetch_or(bit, Ordering::AcqRel);
            present &= previous & bit != 0;
        }
        present
    }

    /// Whether every bit of `key` is set
    pub fn contains(&self, key: u64) -> bool {
        self.probes.positions(key).all(|pos| {
            self.words[(pos / 64) as usize].load(Ordering::Acquire) & (1u64 << (pos % 64)) != 0
        })
    }
}

//! Reading and writing sorted (key, count) artifacts
//!
//! Binary artifacts are memory-mapped and walked by record offset; text
//! artifacts are read line by line. Both decode to the same `(key, count)`
//! pairs, so every consumer (merge, conversion, histogram, stats) works on
//! either encoding.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{CountError, Result};
use crate::kmer::Kmer;
use crate::serialization::{decode_record, encode_record, ArtifactHeader, FormatTag};

/// Size of the write buffer for artifacts
const WRITE_BUFFER_BYTES: usize = 1 << 20;

/// Writes (key, count) records after a header
pub struct ArtifactWriter {
    out: BufWriter<File>,
    header: ArtifactHeader,
    record: Vec<u8>,
    line: String,
    written: u64,
}

impl ArtifactWriter {
    /// Create `path` and write `header`
    pub fn create<P: AsRef<Path>>(path: P, header: ArtifactHeader) -> Result<Self> {
        if header.format == FormatTag::BloomCounter {
            return Err(CountError::InvalidArtifact(
                "a bloom counter is not a (key, count) artifact".to_string(),
            ));
        }
        let file = File::create(path.as_ref())?;
        let mut out = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);
        header.write(&mut out)?;
        Ok(Self { out, header, record: Vec::with_capacity(16), line: String::new(), written: 0 })
    }

    /// Header written at the top of the artifact
    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    /// Append one record. Binary counts above the counter width saturate.
    pub fn write(&mut self, key: u64, count: u64) -> Result<()> {
        match self.header.format {
            FormatTag::Binary => {
                self.record.clear();
                encode_record(
                    &mut self.record,
                    key,
                    count,
                    self.header.key_bytes(),
                    self.header.counter_bytes as usize,
                );
                self.out.write_all(&self.record)?;
            }
            _ => {
                use std::fmt::Write as _;
                self.line.clear();
                let _ = writeln!(self.line, "{} {}", Kmer::new(key, self.header.k()), count);
                self.out.write_all(self.line.as_bytes())?;
            }
        }
        self.written += 1;
        Ok(())
    }

    /// Flush and return the number of records written
    pub fn finish(mut self) -> Result<u64> {
        self.out.flush()?;
        Ok(self.written)
    }
}

enum Body {
    Binary { mmap: Mmap, pos: usize, record_len: usize },
    Text { lines: BufReader<File>, line: String },
}

/// Sequential reader over an artifact's records
pub struct ArtifactReader {
    path: PathBuf,
    header: ArtifactHeader,
    body: Body,
}

impl ArtifactReader {
    /// Open `path` and validate its header
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);
        let header = ArtifactHeader::read(&mut reader).map_err(|e| {
            CountError::InvalidArtifact(format!("{}: {}", path.display(), e))
        })?;

        let body = match header.format {
            FormatTag::Binary => {
                let file = reader.into_inner();
                let mmap = unsafe { Mmap::map(&file)? };
                let start = header.encoded_len();
                let record_len = header.record_len();
                if mmap.len() < start || (mmap.len() - start) % record_len != 0 {
                    return Err(CountError::InvalidArtifact(format!(
                        "{}: truncated body ({} bytes after header, records of {} bytes)",
                        path.display(),
                        mmap.len().saturating_sub(start),
                        record_len
                    )));
                }
                Body::Binary { mmap, pos: start, record_len }
            }
            FormatTag::Text => Body::Text { lines: reader, line: String::new() },
            FormatTag::BloomCounter => {
                return Err(CountError::InvalidArtifact(format!(
                    "{}: a bloom counter holds no (key, count) records",
                    path.display()
                )))
            }
        };
        Ok(Self { path, header, body })
    }

    /// Header of the artifact
    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    /// Path the artifact was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw records of a binary artifact, `None` for text
    pub fn binary_records(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Binary { mmap, .. } => Some(&mmap[self.header.encoded_len()..]),
            Body::Text { .. } => None,
        }
    }

    /// Next (key, count) record, `None` at the end
    pub fn next_entry(&mut self) -> Result<Option<(u64, u64)>> {
        match &mut self.body {
            Body::Binary { mmap, pos, record_len } => {
                if *pos >= mmap.len() {
                    return Ok(None);
                }
                let entry = decode_record(
                    &mmap[*pos..],
                    self.header.key_bytes(),
                    self.header.counter_bytes as usize,
                );
                *pos += *record_len;
                Ok(Some(entry))
            }
            Body::Text { lines, line } => loop {
                line.clear();
                if lines.read_line(line)? == 0 {
                    return Ok(None);
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                return parse_text_record(trimmed, self.header.k())
                    .map(Some)
                    .ok_or_else(|| {
                        CountError::InvalidArtifact(format!(
                            "{}: malformed record {:?}",
                            self.path.display(),
                            trimmed
                        ))
                    });
            },
        }
    }
}

fn parse_text_record(line: &str, k: usize) -> Option<(u64, u64)> {
    let (kmer, count) = line.split_once(char::is_whitespace)?;
    let kmer = Kmer::from_str_k(kmer, k).ok()?;
    let count = count.trim().parse().ok()?;
    Some((kmer.bits(), count))
}

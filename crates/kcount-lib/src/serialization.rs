//! Self-describing artifact header and record codec
//!
//! Every artifact written by kcount (final dump, intermediate dump, text
//! dump, bloom counter snapshot) starts with the same header, so a file can
//! be validated before its body is interpreted.
//!
//! # File Format
//!
//! ```text
//! ArtifactHeader
//!   ├─ magic: "KCOUNT01"
//!   ├─ version_major: u32
//!   ├─ version_minor: u32
//!   ├─ format: u8            (1 binary, 2 text, 3 bloom counter)
//!   ├─ key_len: u32          (bits, 2k)
//!   ├─ counter_bytes: u32
//!   ├─ canonical: u8
//!   ├─ seeds: [u64; 2]
//!   ├─ size: u64
//!   ├─ nb_hashes: u32
//!   ├─ max_reprobe: u32
//!   └─ cmdline: u32 length + UTF-8
//! Body
//!   binary: [key: ceil(key_len/8) bytes LE][count: counter_bytes LE] ...
//!   text:   "KMER COUNT\n" ...
//!   bloom:  ceil(size/32) u64 words LE
//! ```
//!
//! Binary records have a fixed width so a mapped body can be walked with
//! plain offsets.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::constants::{bytes_for_bits, MAX_K};

/// Magic bytes for kcount artifacts
const MAGIC: &[u8; 8] = b"KCOUNT01";

/// File format version: (major, minor)
/// Increment major on breaking changes, minor on compatible changes
const FORMAT_VERSION: (u32, u32) = (1, 0);

/// Longest command line stored in a header
const MAX_CMDLINE_LEN: usize = 1 << 20;

/// What the body of an artifact contains
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatTag {
    /// Sorted fixed-width binary (key, count) records
    Binary,
    /// Sorted `KMER COUNT` lines
    Text,
    /// Bloom counter cells
    BloomCounter,
}

impl FormatTag {
    fn to_byte(self) -> u8 {
        match self {
            FormatTag::Binary => 1,
            FormatTag::Text => 2,
            FormatTag::BloomCounter => 3,
        }
    }

    fn from_byte(byte: u8) -> io::Result<Self> {
        match byte {
            1 => Ok(FormatTag::Binary),
            2 => Ok(FormatTag::Text),
            3 => Ok(FormatTag::BloomCounter),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown artifact format tag {}", other),
            )),
        }
    }

    /// Name used in diagnostics and by `info`
    pub fn name(self) -> &'static str {
        match self {
            FormatTag::Binary => "binary/sorted",
            FormatTag::Text => "text/sorted",
            FormatTag::BloomCounter => "bloomcounter",
        }
    }
}

/// Header shared by all artifacts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactHeader {
    /// Body format
    pub format: FormatTag,
    /// Key length in bits (twice the k-mer length)
    pub key_len: u32,
    /// Width of binary counters in bytes (0 for text and bloom)
    pub counter_bytes: u32,
    /// Whether keys are canonical
    pub canonical: bool,
    /// Hash seeds of the structure that produced the artifact
    pub seeds: [u64; 2],
    /// Table slots or bloom cells
    pub size: u64,
    /// Number of bloom hash functions (0 for dumps)
    pub nb_hashes: u32,
    /// Maximum reprobe of the producing table
    pub max_reprobe: u32,
    /// Command line that produced the artifact
    pub cmdline: String,
}

impl ArtifactHeader {
    /// Header for a sorted dump of `k`-mers
    pub fn dump(format: FormatTag, k: usize, counter_bytes: u32, canonical: bool) -> Self {
        Self {
            format,
            key_len: 2 * k as u32,
            counter_bytes: if format == FormatTag::Binary { counter_bytes } else { 0 },
            canonical,
            seeds: [0, 0],
            size: 0,
            nb_hashes: 0,
            max_reprobe: 0,
            cmdline: String::new(),
        }
    }

    /// k-mer length recorded in the header
    pub fn k(&self) -> usize {
        (self.key_len / 2) as usize
    }

    /// Bytes used by one key in a binary record
    pub fn key_bytes(&self) -> usize {
        bytes_for_bits(self.key_len)
    }

    /// Bytes used by one binary record
    pub fn record_len(&self) -> usize {
        self.key_bytes() + self.counter_bytes as usize
    }

    /// Encoded size of this header in bytes
    pub fn encoded_len(&self) -> usize {
        8 + 4 + 4 + 1 + 4 + 4 + 1 + 16 + 8 + 4 + 4 + 4 + self.cmdline.len()
    }

    /// Write header to a writer
    pub fn write(&self, writer: &mut dyn Write) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_all(&FORMAT_VERSION.0.to_le_bytes())?;
        writer.write_all(&FORMAT_VERSION.1.to_le_bytes())?;
        writer.write_all(&[self.format.to_byte()])?;
        writer.write_all(&self.key_len.to_le_bytes())?;
        writer.write_all(&self.counter_bytes.to_le_bytes())?;
        writer.write_all(&[self.canonical as u8])?;
        writer.write_all(&self.seeds[0].to_le_bytes())?;
        writer.write_all(&self.seeds[1].to_le_bytes())?;
        writer.write_all(&self.size.to_le_bytes())?;
        writer.write_all(&self.nb_hashes.to_le_bytes())?;
        writer.write_all(&self.max_reprobe.to_le_bytes())?;
        writer.write_all(&(self.cmdline.len() as u32).to_le_bytes())?;
        writer.write_all(self.cmdline.as_bytes())?;
        Ok(())
    }

    /// Read header from a reader
    pub fn read(reader: &mut dyn Read) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;

        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid magic number for kcount artifact",
            ));
        }

        let version_major = read_u32(reader)?;
        let version_minor = read_u32(reader)?;
        if version_major != FORMAT_VERSION.0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Incompatible format version: {}.{}, expected {}.{}",
                    version_major, version_minor, FORMAT_VERSION.0, FORMAT_VERSION.1
                ),
            ));
        }

        let format = FormatTag::from_byte(read_u8(reader)?)?;
        let key_len = read_u32(reader)?;
        let counter_bytes = read_u32(reader)?;
        let canonical = read_u8(reader)? != 0;
        let seeds = [read_u64(reader)?, read_u64(reader)?];
        let size = read_u64(reader)?;
        let nb_hashes = read_u32(reader)?;
        let max_reprobe = read_u32(reader)?;

        let cmdline_len = read_u32(reader)? as usize;
        if cmdline_len > MAX_CMDLINE_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Command line too long"));
        }
        let mut cmdline = vec![0u8; cmdline_len];
        reader.read_exact(&mut cmdline)?;
        let cmdline = String::from_utf8(cmdline)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if key_len == 0 || key_len as usize > 2 * MAX_K || key_len % 2 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid key length {} bits", key_len),
            ));
        }
        if format == FormatTag::Binary && !(1..=8).contains(&counter_bytes) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid counter width {} bytes", counter_bytes),
            ));
        }

        Ok(Self {
            format,
            key_len,
            counter_bytes,
            canonical,
            seeds,
            size,
            nb_hashes,
            max_reprobe,
            cmdline,
        })
    }
}

fn read_u8(reader: &mut dyn Read) -> io::Result<u8> {
    let mut bytes = [0u8; 1];
    reader.read_exact(&mut bytes)?;
    Ok(bytes[0])
}

fn read_u32(reader: &mut dyn Read) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(reader: &mut dyn Read) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Largest count representable in `counter_bytes` bytes
#[inline]
pub fn max_count(counter_bytes: u32) -> u64 {
    if counter_bytes >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * counter_bytes)) - 1
    }
}

/// Encode one binary record into `out`, saturating the count.
#[inline]
pub fn encode_record(out: &mut Vec<u8>, key: u64, count: u64, key_bytes: usize, counter_bytes: usize) {
    out.extend_from_slice(&key.to_le_bytes()[..key_bytes]);
    let count = count.min(max_count(counter_bytes as u32));
    out.extend_from_slice(&count.to_le_bytes()[..counter_bytes]);
}

/// Decode one binary record from the front of `bytes`.
#[inline]
pub fn decode_record(bytes: &[u8], key_bytes: usize, counter_bytes: usize) -> (u64, u64) {
    let mut key = [0u8; 8];
    key[..key_bytes].copy_from_slice(&bytes[..key_bytes]);
    let mut count = [0u8; 8];
    count[..counter_bytes].copy_from_slice(&bytes[key_bytes..key_bytes + counter_bytes]);
    (u64::from_le_bytes(key), u64::from_le_bytes(count))
}

/// Path of the `index`-th intermediate artifact for output `prefix`
pub fn intermediate_path<P: AsRef<Path>>(prefix: P, index: usize) -> PathBuf {
    let mut name = prefix.as_ref().as_os_str().to_os_string();
    name.push(format!("_{}", index));
    PathBuf::from(name)
}

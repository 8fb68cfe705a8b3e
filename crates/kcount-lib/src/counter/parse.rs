//! Block-wise FASTA/FASTQ parsing shared by all workers
//!
//! One worker at a time holds the producer lock and reads the next block of
//! raw bytes from the current stream. The block is cut at its last complete
//! record boundary and the tail is carried into the next block, so records
//! never straddle blocks. Decoding happens outside the lock with needletail.
//!
//! Buffers come from a bounded pool and go back to it when the [`Block`] is
//! dropped; a worker waits when every buffer is in use.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use needletail::parse_fastx_reader;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::source::{OpenStream, RecordSource};
use crate::error::Result;

/// Record syntax of a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqFormat {
    /// `>` header, sequence lines
    Fasta,
    /// `@` header, sequence, `+`, quality (four lines per record)
    Fastq,
}

impl SeqFormat {
    /// Format announced by the first non-whitespace byte
    pub fn detect(first: u8) -> Option<Self> {
        match first {
            b'>' => Some(SeqFormat::Fasta),
            b'@' => Some(SeqFormat::Fastq),
            _ => None,
        }
    }

    /// End of the last complete record in `data`, which starts at a record
    /// boundary. `None` if no record is known to be complete yet.
    pub fn last_boundary(self, data: &[u8]) -> Option<usize> {
        match self {
            SeqFormat::Fasta => data
                .windows(2)
                .rposition(|w| w == b"\n>")
                .map(|pos| pos + 1)
                .filter(|&cut| cut > 0),
            SeqFormat::Fastq => {
                let mut lines = 0usize;
                let mut cut = None;
                for (pos, _) in data.iter().enumerate().filter(|&(_, &b)| b == b'\n') {
                    lines += 1;
                    if lines % 4 == 0 {
                        cut = Some(pos + 1);
                    }
                }
                cut
            }
        }
    }
}

/// Failure of one input stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamError {
    /// Stream name
    pub stream: String,
    /// What went wrong
    pub message: String,
}

struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    available: Condvar,
}

impl BufferPool {
    fn new(buffers: usize) -> Self {
        Self { free: Mutex::new((0..buffers.max(1)).map(|_| Vec::new()).collect()), available: Condvar::new() }
    }

    fn acquire(&self) -> Vec<u8> {
        let mut free = self.free.lock();
        loop {
            if let Some(buffer) = free.pop() {
                return buffer;
            }
            self.available.wait(&mut free);
        }
    }

    fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        self.free.lock().push(buffer);
        self.available.notify_one();
    }
}

/// Records decoded from one block
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockSummary {
    /// Records handed to the callback
    pub records: u64,
    /// Parse error that ended the block early
    pub malformed: Option<String>,
}

/// A chunk of whole records from one stream
pub struct Block<'a> {
    data: Vec<u8>,
    stream: Arc<str>,
    pool: &'a BufferPool,
}

impl Block<'_> {
    /// Raw bytes of the block
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Name of the stream the block came from
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Call `f(seq, qual)` for each record until it returns `false`. A
    /// malformed record ends the block; it is reported in the summary, not
    /// as an error. Errors from `f` are propagated.
    pub fn for_each_record<F>(&self, mut f: F) -> Result<BlockSummary>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> Result<bool>,
    {
        let mut summary = BlockSummary::default();
        let mut reader = match parse_fastx_reader(&self.data[..]) {
            Ok(reader) => reader,
            Err(e) => {
                summary.malformed = Some(e.to_string());
                return Ok(summary);
            }
        };
        while let Some(record) = reader.next() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    summary.malformed = Some(e.to_string());
                    break;
                }
            };
            summary.records += 1;
            let seq = record.seq();
            if !f(&seq, record.qual())? {
                break;
            }
        }
        Ok(summary)
    }
}

impl Drop for Block<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.data));
    }
}

struct Current {
    stream: OpenStream,
    name: Arc<str>,
    format: SeqFormat,
    remainder: Vec<u8>,
}

struct Producer {
    sources: VecDeque<RecordSource>,
    current: Option<Current>,
}

/// Hands out blocks of whole records from a list of sources, in order
pub struct SequenceParser {
    producer: Mutex<Producer>,
    pool: BufferPool,
    block_size: usize,
    finished: AtomicBool,
    errors: Mutex<Vec<StreamError>>,
}

impl SequenceParser {
    /// Parser over `sources` with `buffers` reusable blocks of about
    /// `block_size` bytes
    pub fn new(sources: Vec<RecordSource>, buffers: usize, block_size: usize) -> Self {
        Self {
            producer: Mutex::new(Producer { sources: sources.into(), current: None }),
            pool: BufferPool::new(buffers),
            block_size: block_size.max(1),
            finished: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Record a failure of `stream`
    pub fn record_error(&self, stream: &str, message: impl Into<String>) {
        let error = StreamError { stream: stream.to_string(), message: message.into() };
        warn!("{}: {}", error.stream, error.message);
        self.errors.lock().push(error);
    }

    /// Stream errors recorded so far, in order
    pub fn take_errors(&self) -> Vec<StreamError> {
        std::mem::take(&mut *self.errors.lock())
    }

    /// Next block, `None` once every source is drained
    pub fn next_block(&self) -> Option<Block<'_>> {
        if self.finished.load(Ordering::Acquire) {
            return None;
        }
        let mut data = self.pool.acquire();
        let mut producer = self.producer.lock();
        loop {
            if producer.current.is_none() {
                match producer.sources.pop_front() {
                    None => {
                        self.finished.store(true, Ordering::Release);
                        drop(producer);
                        self.pool.release(data);
                        return None;
                    }
                    Some(source) => {
                        producer.current = self.open(&source);
                        continue;
                    }
                }
            }
            let Some(current) = producer.current.as_mut() else {
                continue;
            };

            data.clear();
            data.append(&mut current.remainder);
            let mut eof = false;
            loop {
                match current.stream.reader().take(self.block_size as u64).read_to_end(&mut data) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(_) => {
                        if let Some(cut) = current.format.last_boundary(&data) {
                            current.remainder.extend_from_slice(&data[cut..]);
                            data.truncate(cut);
                            break;
                        }
                    }
                    Err(e) => {
                        self.record_error(&current.name, format!("read failed: {}", e));
                        data.clear();
                        eof = true;
                        break;
                    }
                }
            }

            let name = Arc::clone(&current.name);
            if eof {
                if let Some(finished) = producer.current.take() {
                    debug!("Finished reading {}", finished.name);
                    if let Err(e) = finished.stream.finish() {
                        self.record_error(&finished.name, e.to_string());
                    }
                }
            }
            if data.iter().any(|b| !b.is_ascii_whitespace()) {
                return Some(Block { data, stream: name, pool: &self.pool });
            }
        }
    }

    fn open(&self, source: &RecordSource) -> Option<Current> {
        let name: Arc<str> = Arc::from(source.name());
        let mut stream = match source.open() {
            Ok(stream) => stream,
            Err(e) => {
                self.record_error(&name, format!("cannot open: {}", e));
                return None;
            }
        };
        let format = match stream.first_byte() {
            Ok(Some(byte)) => SeqFormat::detect(byte),
            Ok(None) => {
                debug!("{} is empty", name);
                return None;
            }
            Err(e) => {
                self.record_error(&name, format!("read failed: {}", e));
                return None;
            }
        };
        match format {
            Some(format) => {
                debug!("Reading {} as {:?}", name, format);
                Some(Current { stream, name, format, remainder: Vec::new() })
            }
            None => {
                self.record_error(&name, "unrecognized format, expected FASTA or FASTQ");
                None
            }
        }
    }
}

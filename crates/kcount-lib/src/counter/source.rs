//! Input streams: files, named pipes and generator commands
//!
//! Every stream is sniffed for the gzip magic `1f 8b` and transparently
//! decompressed. Generator commands run under `shell -c`; their standard
//! output is the stream and a nonzero exit status is a stream error.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use flate2::read::MultiGzDecoder;
use tracing::debug;

use crate::error::{CountError, Result};

const READ_BUFFER_BYTES: usize = 256 * 1024;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Where sequence records come from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordSource {
    /// Regular file, possibly gzipped
    File(PathBuf),
    /// Named pipe; opening blocks until a writer appears
    Pipe(PathBuf),
    /// Command whose standard output is read
    Command {
        /// Command line passed to the shell
        command: String,
        /// Shell used to run it
        shell: String,
    },
}

impl RecordSource {
    /// Source for `path`, a named pipe if the path is a FIFO
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        if is_fifo(&path) {
            RecordSource::Pipe(path)
        } else {
            RecordSource::File(path)
        }
    }

    /// One command per line of `path`; blank lines and `#` comments are skipped.
    pub fn from_generator_file<P: AsRef<Path>>(path: P, shell: &str) -> Result<Vec<Self>> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut sources = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let command = line.trim();
            if command.is_empty() || command.starts_with('#') {
                continue;
            }
            sources.push(RecordSource::Command { command: command.to_string(), shell: shell.to_string() });
        }
        debug!("{} generator commands in {:?}", sources.len(), path);
        Ok(sources)
    }

    /// Name used in logs and stream errors
    pub fn name(&self) -> String {
        match self {
            RecordSource::File(path) | RecordSource::Pipe(path) => path.display().to_string(),
            RecordSource::Command { command, .. } => format!("`{}`", command),
        }
    }

    /// Open the stream
    pub fn open(&self) -> Result<OpenStream> {
        let (raw, child): (Box<dyn Read + Send>, Option<Child>) = match self {
            RecordSource::File(path) | RecordSource::Pipe(path) => (Box::new(File::open(path)?), None),
            RecordSource::Command { command, shell } => {
                let mut child = Command::new(shell).arg("-c").arg(command).stdout(Stdio::piped()).spawn()?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| CountError::Io(io::Error::other("generator stdout was not captured")))?;
                (Box::new(stdout), Some(child))
            }
        };
        Ok(OpenStream { name: self.name(), reader: decompressed(raw)?, child })
    }
}

#[cfg(unix)]
fn is_fifo(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path).map(|m| m.file_type().is_fifo()).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_fifo(_path: &Path) -> bool {
    false
}

fn decompressed(raw: Box<dyn Read + Send>) -> io::Result<Box<dyn BufRead + Send>> {
    let mut buffered = BufReader::with_capacity(READ_BUFFER_BYTES, raw);
    let gzipped = buffered.fill_buf()?.starts_with(&GZIP_MAGIC);
    if gzipped {
        Ok(Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, MultiGzDecoder::new(buffered))))
    } else {
        Ok(Box::new(buffered))
    }
}

/// An open input stream
pub struct OpenStream {
    name: String,
    reader: Box<dyn BufRead + Send>,
    child: Option<Child>,
}

impl OpenStream {
    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decompressed bytes of the stream
    pub fn reader(&mut self) -> &mut (dyn BufRead + Send) {
        self.reader.as_mut()
    }

    /// Skip leading whitespace and return the first byte, `None` if the
    /// stream holds nothing else.
    pub fn first_byte(&mut self) -> io::Result<Option<u8>> {
        loop {
            let buf = self.reader.fill_buf()?;
            if buf.is_empty() {
                return Ok(None);
            }
            match buf.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(pos) => {
                    let byte = buf[pos];
                    self.reader.consume(pos);
                    return Ok(Some(byte));
                }
                None => {
                    let len = buf.len();
                    self.reader.consume(len);
                }
            }
        }
    }

    /// Reap a generator; its failure is an error.
    pub fn finish(mut self) -> io::Result<()> {
        if let Some(mut child) = self.child.take() {
            let status = child.wait()?;
            if !status.success() {
                return Err(io::Error::other(format!("generator exited with {}", status)));
            }
        }
        Ok(())
    }
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn read_all(source: &RecordSource) -> Vec<u8> {
        let mut stream = source.open().unwrap();
        let mut out = Vec::new();
        stream.reader().read_to_end(&mut out).unwrap();
        stream.finish().unwrap();
        out
    }

    #[test]
    fn test_plain_and_gzip_files() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("reads.fa");
        std::fs::write(&plain, b">r\nACGT\n").unwrap();

        let gz = dir.path().join("reads.fa.gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(b">r\nACGT\n").unwrap();
        encoder.finish().unwrap();

        assert_eq!(read_all(&RecordSource::from_path(&plain)), b">r\nACGT\n");
        assert_eq!(read_all(&RecordSource::from_path(&gz)), b">r\nACGT\n");
    }

    #[test]
    fn test_first_byte_skips_whitespace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reads.fq");
        std::fs::write(&path, b"\n\n  @r\nAC\n+\nII\n").unwrap();
        let mut stream = RecordSource::File(path).open().unwrap();
        assert_eq!(stream.first_byte().unwrap(), Some(b'@'));
        let mut rest = String::new();
        stream.reader().read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "@r\nAC\n+\nII\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_generator_commands() {
        let dir = TempDir::new().unwrap();
        let generators = dir.path().join("generators");
        std::fs::write(&generators, "# comment\n\necho '>g'\nprintf 'ACGT\\n'\nexit 3\n").unwrap();
        let sources = RecordSource::from_generator_file(&generators, "sh").unwrap();
        assert_eq!(sources.len(), 3);
        assert_eq!(read_all(&sources[0]), b">g\n");
        assert_eq!(read_all(&sources[1]), b"ACGT\n");

        let mut failing = sources[2].open().unwrap();
        let mut out = Vec::new();
        failing.reader().read_to_end(&mut out).unwrap();
        assert!(failing.finish().is_err());
    }

    #[test]
    fn test_missing_file() {
        let source = RecordSource::File(PathBuf::from("/nonexistent/reads.fa"));
        assert!(matches!(source.open(), Err(CountError::Io(_))));
    }
}

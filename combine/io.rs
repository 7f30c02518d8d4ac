// ========================================================================================
//
//                       Chunked decompression and line assembly
//
// ========================================================================================
//
// ### Purpose ###
//
// Painting matrices are large gzip files whose header alone can hold many thousands of
// sample names. This module turns such a stream into complete lines without ever
// holding more than one read chunk (plus at most one straddling line) in memory.
//
// Lines that sit entirely inside the current chunk are handed out as borrowed slices of
// that chunk. A line that crosses a chunk boundary is assembled in a reusable spill
// buffer and handed out from there instead.

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use memchr::memchr;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Default size of one decompressed read.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// ========================================================================================
//                                  Stream sources
// ========================================================================================

/// A named input that can be opened from the start any number of times.
///
/// The first input of a run is opened more than once (header, optional row census,
/// contribution pass), so sources hand out fresh readers rather than being readers.
pub trait MatrixSource: Send + Sync {
    /// Human-readable name used in logs and error messages.
    fn label(&self) -> &str;

    /// Opens the source and returns its decompressed bytes.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
}

impl<T: MatrixSource + ?Sized> MatrixSource for Box<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        (**self).open()
    }
}

/// An input file on disk. Gzip members are decompressed transparently; a file
/// without the gzip magic is read as plain text.
#[derive(Debug, Clone)]
pub struct GzPathSource {
    path: PathBuf,
    label: String,
}

impl GzPathSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = path.display().to_string();
        Self { path, label }
    }
}

impl MatrixSource for GzPathSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        decode_stream(File::open(&self.path)?)
    }
}

/// An input held in memory. Its bytes may be gzip-compressed or plain.
#[derive(Debug, Clone)]
pub struct MemorySource {
    label: String,
    bytes: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(label: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            label: label.into(),
            bytes: bytes.into(),
        }
    }

    /// Compresses `text` with gzip and wraps the result.
    pub fn gzipped(label: impl Into<String>, text: &[u8]) -> io::Result<Self> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(text.len() / 2), Compression::fast());
        encoder.write_all(text)?;
        Ok(Self::new(label, encoder.finish()?))
    }
}

impl MatrixSource for MemorySource {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        decode_stream(Cursor::new(Arc::clone(&self.bytes)))
    }
}

/// Sniffs the gzip magic and wraps the stream in a multi-member decoder if present.
pub fn decode_stream<R>(reader: R) -> io::Result<Box<dyn Read + Send>>
where
    R: Read + Send + 'static,
{
    let mut buffered = BufReader::new(reader);
    let is_gzip = buffered.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip {
        Ok(Box::new(MultiGzDecoder::new(buffered)))
    } else {
        Ok(Box::new(buffered))
    }
}

// ========================================================================================
//                                 Chunked line reader
// ========================================================================================

#[derive(Debug, Error)]
pub enum LineError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("stream ended before the header line was terminated")]
    TruncatedHeader,
}

/// Where the line found by `scan_line` lives.
enum LineSpan {
    /// Entirely inside the current chunk.
    Chunk { begin: usize, end: usize },
    /// Assembled in the spill buffer. `terminated` is false for an unterminated tail.
    Spill { terminated: bool },
    Exhausted,
}

pub struct ChunkedLineReader<R> {
    inner: R,
    chunk: Vec<u8>,
    /// Start of the unread part of `chunk`.
    start: usize,
    /// Number of valid bytes in `chunk`.
    filled: usize,
    spill: Vec<u8>,
    exhausted: bool,
    lines_spilled: u64,
}

impl<R: Read> ChunkedLineReader<R> {
    pub fn new(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk: vec![0; chunk_size.max(1)],
            start: 0,
            filled: 0,
            spill: Vec::new(),
            exhausted: false,
            lines_spilled: 0,
        }
    }

    /// Number of lines so far that had to be copied because they crossed a chunk boundary.
    pub fn lines_spilled(&self) -> u64 {
        self.lines_spilled
    }

    /// Returns the next line without its terminator, or `None` at end of stream.
    ///
    /// A final line without a trailing newline is still returned.
    pub fn next_line(&mut self) -> io::Result<Option<&[u8]>> {
        match self.scan_line()? {
            LineSpan::Chunk { begin, end } => Ok(Some(&self.chunk[begin..end])),
            LineSpan::Spill { .. } => Ok(Some(&self.spill)),
            LineSpan::Exhausted => Ok(None),
        }
    }

    /// Reads a line that must be terminated, however long it is.
    ///
    /// Used for headers, where a missing terminator means the file was cut short and no
    /// row can be positioned.
    pub fn read_header_line(&mut self) -> Result<&[u8], LineError> {
        match self.scan_line()? {
            LineSpan::Chunk { begin, end } => Ok(&self.chunk[begin..end]),
            LineSpan::Spill { terminated: true } => Ok(&self.spill),
            LineSpan::Spill { terminated: false } | LineSpan::Exhausted => {
                Err(LineError::TruncatedHeader)
            }
        }
    }

    fn scan_line(&mut self) -> io::Result<LineSpan> {
        self.spill.clear();
        let mut spilled = false;

        loop {
            if let Some(pos) = memchr(b'\n', &self.chunk[self.start..self.filled]) {
                let begin = self.start;
                let end = begin + pos;
                self.start = end + 1;
                if spilled {
                    self.spill.extend_from_slice(&self.chunk[begin..end]);
                    self.lines_spilled += 1;
                    return Ok(LineSpan::Spill { terminated: true });
                }
                return Ok(LineSpan::Chunk { begin, end });
            }

            // No terminator in what is left of this chunk: carry it over.
            if self.start < self.filled {
                self.spill
                    .extend_from_slice(&self.chunk[self.start..self.filled]);
                spilled = true;
            }
            self.start = self.filled;

            if self.refill()? == 0 {
                if spilled {
                    self.lines_spilled += 1;
                    return Ok(LineSpan::Spill { terminated: false });
                }
                return Ok(LineSpan::Exhausted);
            }
        }
    }

    /// Fills the chunk with as many bytes as the stream will give, like `gzread`.
    fn refill(&mut self) -> io::Result<usize> {
        self.start = 0;
        self.filled = 0;
        if self.exhausted {
            return Ok(0);
        }

        while self.filled < self.chunk.len() {
            match self.inner.read(&mut self.chunk[self.filled..]) {
                Ok(0) => {
                    self.exhausted = true;
                    break;
                }
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(self.filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_lines(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
        let mut reader = ChunkedLineReader::new(data, chunk_size);
        let mut out = Vec::new();
        while let Some(line) = reader.next_line().expect("in-memory read") {
            out.push(line.to_vec());
        }
        out
    }

    #[test]
    fn lines_are_identical_for_every_chunk_size() {
        let data = b"RECIPIENT A B\nA 1.0 2.0\nB 3.5 4.25\n\nC 9 9\n";
        let expected = collect_lines(data, 4096);
        assert_eq!(expected.len(), 5);
        for chunk_size in 1..=data.len() + 1 {
            assert_eq!(collect_lines(data, chunk_size), expected, "chunk {chunk_size}");
        }
    }

    #[test]
    fn unterminated_tail_is_the_last_line() {
        let lines = collect_lines(b"a b\nc d", 3);
        assert_eq!(lines, vec![b"a b".to_vec(), b"c d".to_vec()]);
    }

    #[test]
    fn straddling_lines_are_counted() {
        let mut reader = ChunkedLineReader::new(&b"aaaa\nbb\n"[..], 3);
        assert_eq!(reader.next_line().unwrap(), Some(&b"aaaa"[..]));
        assert_eq!(reader.next_line().unwrap(), Some(&b"bb"[..]));
        assert_eq!(reader.next_line().unwrap(), None);
        assert_eq!(reader.lines_spilled(), 2);
    }

    #[test]
    fn long_header_is_read_across_many_chunks() {
        let mut header = String::from("RECIPIENT");
        for i in 0..500 {
            header.push_str(&format!(" sample{i}"));
        }
        let text = format!("{header}\nrow 1\n");
        let mut reader = ChunkedLineReader::new(text.as_bytes(), 16);
        assert_eq!(reader.read_header_line().unwrap(), header.as_bytes());
        assert_eq!(reader.next_line().unwrap(), Some(&b"row 1"[..]));
    }

    #[test]
    fn header_without_terminator_is_truncated() {
        let mut reader = ChunkedLineReader::new(&b"RECIPIENT A B"[..], 4);
        assert!(matches!(
            reader.read_header_line(),
            Err(LineError::TruncatedHeader)
        ));

        let mut empty = ChunkedLineReader::new(&b""[..], 4);
        assert!(matches!(
            empty.read_header_line(),
            Err(LineError::TruncatedHeader)
        ));
    }

    #[test]
    fn gzip_and_plain_sources_decode_to_the_same_text() {
        let text = b"RECIPIENT A\nA 1\n";
        let zipped = MemorySource::gzipped("zipped", text).unwrap();
        let plain = MemorySource::new("plain", text.to_vec());

        for source in [&zipped as &dyn MatrixSource, &plain] {
            let mut decoded = Vec::new();
            source.open().unwrap().read_to_end(&mut decoded).unwrap();
            assert_eq!(decoded, text, "{}", source.label());
        }
    }

    #[test]
    fn concatenated_gzip_members_are_read_through() {
        let first = MemorySource::gzipped("a", b"RECIPIENT A\n").unwrap();
        let second = MemorySource::gzipped("b", b"A 2\n").unwrap();
        let mut joined = Vec::new();
        for part in [&first, &second] {
            joined.extend_from_slice(&part.bytes);
        }
        let source = MemorySource::new("joined", joined);
        let mut reader = ChunkedLineReader::new(source.open().unwrap(), 5);
        assert_eq!(reader.read_header_line().unwrap(), b"RECIPIENT A");
        assert_eq!(reader.next_line().unwrap(), Some(&b"A 2"[..]));
    }

    #[test]
    fn missing_file_fails_to_open() {
        let source = GzPathSource::new("/definitely/not/here.gz");
        assert_eq!(source.label(), "/definitely/not/here.gz");
        assert!(source.open().is_err());
    }
}

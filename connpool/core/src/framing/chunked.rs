//! Chunked transfer coding
//!
//! # Wire Format
//!
//! ```text
//! chunk      = chunk-size [ ";" extensions ] CRLF chunk-data CRLF
//! last-chunk = "0" [ ";" extensions ] CRLF
//! body       = *chunk last-chunk *trailer-field CRLF
//! ```
//!
//! Chunk sizes are hexadecimal. Extensions are ignored, but quoted strings
//! inside them may contain CR, LF and backslash escapes, so the size line is
//! scanned with quote awareness rather than split on the first CRLF.

use std::cmp;
use std::io::{self, BufRead, Read, Write};

use super::parser::{latin1, parse_header_lines, Header};
use crate::config::{PoolConfig, DEFAULT_CHUNK_SIZE};
use crate::error::FramingError;

const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Longest size or trailer line accepted before decoding fails
const MAX_LINE_LEN: usize = 8 * 1024;

// =============================================================================
// Encoder
// =============================================================================

/// Writes a body with chunked transfer coding
///
/// Data is buffered and emitted one full chunk at a time; [`finish`] writes
/// the remainder and the terminating zero chunk.
///
/// [`finish`]: ChunkedEncoder::finish
#[derive(Debug)]
pub struct ChunkedEncoder<W: Write> {
    inner: W,
    buf: Vec<u8>,
    capacity: usize,
    finished: bool,
}

impl<W: Write> ChunkedEncoder<W> {
    /// Create an encoder with the default chunk size
    pub fn new(inner: W) -> Self {
        Self::with_capacity(inner, DEFAULT_CHUNK_SIZE)
    }

    /// Create an encoder using the pool's configured chunk size
    pub fn from_config(inner: W, config: &PoolConfig) -> Self {
        Self::with_capacity(inner, config.chunk_size)
    }

    /// Create an encoder emitting chunks of at most `capacity` bytes
    pub fn with_capacity(inner: W, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner,
            buf: Vec::with_capacity(capacity),
            capacity,
            finished: false,
        }
    }

    /// Chunk size
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the terminating chunk has been written
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Write any buffered data as a final chunk, then the zero chunk
    ///
    /// Calling it again does nothing.
    ///
    /// # Errors
    ///
    /// Propagates write errors from the sink.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.buf.is_empty() {
            self.write_chunk()?;
        }
        self.inner.write_all(LAST_CHUNK)?;
        self.inner.flush()?;
        self.finished = true;
        Ok(())
    }

    /// Reference to the sink
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Return the sink, discarding unwritten data
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn write_chunk(&mut self) -> io::Result<()> {
        write!(self.inner, "{:x}\r\n", self.buf.len())?;
        self.inner.write_all(&self.buf)?;
        self.inner.write_all(b"\r\n")?;
        self.buf.clear();
        Ok(())
    }
}

impl<W: Write> Write for ChunkedEncoder<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "write after chunked body was finished",
            ));
        }

        let mut rest = data;
        while !rest.is_empty() {
            let take = cmp::min(self.capacity - self.buf.len(), rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == self.capacity {
                self.write_chunk()?;
            }
        }
        Ok(data.len())
    }

    /// Flushes the sink only; buffered data stays until a chunk fills up
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// =============================================================================
// Decoder
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Size,
    Data { remaining: u64 },
    DataEnd { seen_cr: bool },
    Trailers,
    Done,
    Failed(FramingError),
}

enum Step {
    Push,
    Skip,
    End,
    LoneCr,
}

/// Quote-aware scanner for one chunk-size line
#[derive(Debug, Default)]
struct SizeLineScanner {
    quoted: bool,
    escaped: bool,
    cr: bool,
}

impl SizeLineScanner {
    fn step(&mut self, byte: u8) -> Step {
        if self.cr {
            return if byte == b'\n' { Step::End } else { Step::LoneCr };
        }
        if self.escaped {
            self.escaped = false;
            return Step::Push;
        }
        if self.quoted {
            match byte {
                b'\\' => self.escaped = true,
                b'"' => self.quoted = false,
                _ => {}
            }
            return Step::Push;
        }
        match byte {
            b'\r' => {
                self.cr = true;
                Step::Skip
            }
            b'\n' => Step::End,
            b'"' => {
                self.quoted = true;
                Step::Push
            }
            _ => Step::Push,
        }
    }
}

enum LineStatus {
    Complete,
    Eof,
}

/// Reads a chunked body, yielding the decoded data
///
/// Returns end of input after the zero chunk and its trailers. Partial
/// lines and the unread part of the current chunk survive an interrupted
/// read, so a retried `read` resumes where the last one stopped.
#[derive(Debug)]
pub struct ChunkedDecoder<R: BufRead> {
    inner: R,
    state: State,
    line: Vec<u8>,
    scanner: SizeLineScanner,
    trailer_lines: Vec<String>,
    trailers: Vec<Header>,
}

impl<R: BufRead> ChunkedDecoder<R> {
    /// Create a decoder over a buffered source
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: State::Size,
            line: Vec::new(),
            scanner: SizeLineScanner::default(),
            trailer_lines: Vec::new(),
            trailers: Vec::new(),
        }
    }

    /// Whether the zero chunk and trailers have been consumed
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Trailer fields; empty until the body has been fully read
    #[must_use]
    pub fn trailers(&self) -> &[Header] {
        &self.trailers
    }

    /// Value of the first trailer with the given name
    #[must_use]
    pub fn trailer(&self, name: &str) -> Option<&str> {
        super::parser::find_header(&self.trailers, name).map(Header::value)
    }

    /// Read and discard the rest of the body
    ///
    /// # Errors
    ///
    /// Any read or framing error encountered while draining.
    pub fn exhaust(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }

    /// Reference to the source
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Return the source, positioned wherever decoding stopped
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fail(&mut self, err: FramingError) -> io::Error {
        tracing::trace!(error = %err, "Chunked decoding failed");
        self.state = State::Failed(err.clone());
        err.into()
    }

    /// Accumulate the current line into `self.line`
    fn fill_line(&mut self, size_line: bool) -> io::Result<LineStatus> {
        loop {
            let available = match self.inner.fill_buf() {
                Ok(available) => available,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                return Ok(LineStatus::Eof);
            }

            let mut consumed = 0;
            let mut complete = false;
            let mut lone_cr = false;
            for &byte in available {
                consumed += 1;
                if size_line {
                    match self.scanner.step(byte) {
                        Step::Push => self.line.push(byte),
                        Step::Skip => {}
                        Step::End => complete = true,
                        Step::LoneCr => lone_cr = true,
                    }
                } else if byte == b'\n' {
                    complete = true;
                } else {
                    self.line.push(byte);
                }
                if complete || lone_cr || self.line.len() > MAX_LINE_LEN {
                    break;
                }
            }
            self.inner.consume(consumed);

            if self.line.len() > MAX_LINE_LEN {
                let mut text = latin1(&self.line[..32]);
                text.push_str("...");
                return Err(self.fail(FramingError::InvalidChunkSize(text)));
            }
            if lone_cr {
                let mut text = latin1(&self.line);
                text.push('\r');
                return Err(self.fail(FramingError::InvalidChunkSize(text)));
            }
            if complete {
                if !size_line && self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                return Ok(LineStatus::Complete);
            }
        }
    }

    fn take_line(&mut self) -> String {
        self.scanner = SizeLineScanner::default();
        let line = latin1(&self.line);
        self.line.clear();
        line
    }

    fn read_chunk_size(&mut self) -> io::Result<()> {
        if let LineStatus::Eof = self.fill_line(true)? {
            return Err(self.fail(FramingError::UnexpectedEof));
        }
        let line = self.take_line();
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let valid = !size_text.is_empty() && size_text.bytes().all(|b| b.is_ascii_hexdigit());
        let size = match u64::from_str_radix(size_text, 16) {
            Ok(size) if valid => size,
            _ => return Err(self.fail(FramingError::InvalidChunkSize(line))),
        };

        tracing::trace!(size, "Chunk header");
        self.state = if size == 0 {
            State::Trailers
        } else {
            State::Data { remaining: size }
        };
        Ok(())
    }

    fn read_chunk_terminator(&mut self, mut seen_cr: bool) -> io::Result<()> {
        loop {
            let byte = match self.inner.fill_buf() {
                Ok([]) => return Err(self.fail(FramingError::MissingChunkTerminator)),
                Ok(available) => available[0],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            match (seen_cr, byte) {
                (false, b'\r') => {
                    self.inner.consume(1);
                    seen_cr = true;
                    self.state = State::DataEnd { seen_cr };
                }
                (true, b'\n') => {
                    self.inner.consume(1);
                    self.state = State::Size;
                    return Ok(());
                }
                _ => return Err(self.fail(FramingError::MissingChunkTerminator)),
            }
        }
    }

    fn read_trailers(&mut self) -> io::Result<()> {
        loop {
            let status = self.fill_line(false)?;
            let eof = matches!(status, LineStatus::Eof);
            if eof && self.line.is_empty() {
                break;
            }
            let line = self.take_line();
            let blank = line.trim().is_empty();
            self.trailer_lines.push(line);
            if eof || blank {
                break;
            }
        }

        match parse_header_lines(self.trailer_lines.drain(..)) {
            Ok(trailers) => {
                self.trailers = trailers;
                self.state = State::Done;
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }
}

impl<R: BufRead> Read for ChunkedDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state.clone() {
                State::Size => self.read_chunk_size()?,
                State::Data { remaining } => {
                    let max = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
                    let n = self.inner.read(&mut buf[..max])?;
                    if n == 0 {
                        return Err(self.fail(FramingError::UnexpectedEof));
                    }
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        State::DataEnd { seen_cr: false }
                    } else {
                        State::Data { remaining }
                    };
                    return Ok(n);
                }
                State::DataEnd { seen_cr } => self.read_chunk_terminator(seen_cr)?,
                State::Trailers => self.read_trailers()?,
                State::Done => return Ok(0),
                State::Failed(err) => return Err(err.into()),
            }
        }
    }
}

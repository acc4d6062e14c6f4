//! Content-Length delimited bodies

use std::cmp;
use std::io::{self, Read};

use crate::error::FramingError;

const SKIP_BUFFER_SIZE: usize = 2048;

/// Reads exactly `limit` bytes from a source, then reports end of input
///
/// Never reads past the limit, so the source is left positioned at the
/// next message.
#[derive(Debug)]
pub struct ContentLengthReader<R: Read> {
    inner: R,
    limit: u64,
    pos: u64,
}

impl<R: Read> ContentLengthReader<R> {
    /// Create a reader for a body of `limit` bytes
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            limit,
            pos: 0,
        }
    }

    /// Declared body length
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes not yet read
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.limit - self.pos
    }

    /// Discard up to `n` bytes of the body
    ///
    /// Returns the number of bytes skipped, which is `min(n, remaining)`.
    ///
    /// # Errors
    ///
    /// `FramingError::IncompleteBody` if the source ends early; read errors
    /// are propagated.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        let mut scratch = [0u8; SKIP_BUFFER_SIZE];
        let target = cmp::min(n, self.remaining());
        let mut skipped = 0;
        while skipped < target {
            let want = usize::try_from(target - skipped)
                .map_or(SKIP_BUFFER_SIZE, |left| left.min(SKIP_BUFFER_SIZE));
            match self.read(&mut scratch[..want]) {
                Ok(count) => skipped += count as u64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(skipped)
    }

    /// Read and discard the rest of the body
    ///
    /// # Errors
    ///
    /// As for [`skip`](Self::skip).
    pub fn exhaust(&mut self) -> io::Result<u64> {
        self.skip(self.remaining())
    }

    /// Reference to the source
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Return the source
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ContentLengthReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(FramingError::IncompleteBody {
                expected: self.limit,
                received: self.pos,
            }
            .into());
        }
        self.pos += n as u64;
        Ok(n)
    }
}

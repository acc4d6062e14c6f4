//! Response Bodies
//!
//! [`ResponseBody`] reads a response body off a leased connection and hands
//! the connection back to its manager exactly once, whichever way the body
//! ends. The connection is pooled only if the body ended cleanly (read to
//! the end, or drained by `close`) and the response allows persistence.

use std::fmt;
use std::io::{self, BufRead, Read};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::framing::{
    find_header, AutoReleaseReader, ChunkedDecoder, ContentLengthReader, Header, ReleaseOutcome,
};
use crate::policy::{self, BodyFraming, Disposition, RequestContext, ResponseHead};
use crate::pool::ConnectionManager;

/// A body reader chosen by framing
#[derive(Debug)]
pub enum FramedBody<R: BufRead> {
    /// No body; reads report end of input at once
    Empty(R),
    /// Chunked transfer coding
    Chunked(ChunkedDecoder<R>),
    /// Content-Length delimited
    Length(ContentLengthReader<R>),
    /// Everything until the peer closes
    UntilClose(R),
}

impl<R: BufRead> FramedBody<R> {
    /// Wrap a source according to `framing`
    pub fn new(inner: R, framing: BodyFraming) -> Self {
        match framing {
            BodyFraming::None => Self::Empty(inner),
            BodyFraming::Chunked => Self::Chunked(ChunkedDecoder::new(inner)),
            BodyFraming::Length(limit) => Self::Length(ContentLengthReader::new(inner, limit)),
            BodyFraming::UntilClose => Self::UntilClose(inner),
        }
    }

    /// Trailer fields of a fully read chunked body
    #[must_use]
    pub fn trailers(&self) -> &[Header] {
        match self {
            Self::Chunked(decoder) => decoder.trailers(),
            _ => &[],
        }
    }

    /// Return the source
    pub fn into_inner(self) -> R {
        match self {
            Self::Empty(inner) | Self::UntilClose(inner) => inner,
            Self::Chunked(decoder) => decoder.into_inner(),
            Self::Length(reader) => reader.into_inner(),
        }
    }
}

impl<R: BufRead> Read for FramedBody<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Empty(_) => Ok(0),
            Self::Chunked(decoder) => decoder.read(buf),
            Self::Length(reader) => reader.read(buf),
            Self::UntilClose(inner) => inner.read(buf),
        }
    }
}

/// Response body bound to a leased connection
pub struct ResponseBody {
    reader: AutoReleaseReader<FramedBody<Connection>>,
    disposition: Disposition,
    trailers: Arc<Mutex<Vec<Header>>>,
}

impl ResponseBody {
    /// Start reading the body that follows `head` on `connection`
    ///
    /// A response without a body releases the connection immediately.
    pub fn new(
        connection: Connection,
        head: &ResponseHead,
        ctx: &RequestContext,
        manager: Arc<dyn ConnectionManager>,
    ) -> Self {
        let disposition = policy::disposition(head, ctx);
        let trailers = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&trailers);
        let persistent = disposition.persistent;
        let on_release = move |body: FramedBody<Connection>, outcome: ReleaseOutcome| {
            *sink.lock() = body.trailers().to_vec();
            let mut connection = body.into_inner();
            if !(outcome.is_clean() && persistent) {
                connection.set_reusable(false);
            }
            tracing::debug!(
                connection_id = %connection.id(),
                %outcome,
                reusable = connection.is_reusable(),
                "Response body released"
            );
            let connection_id = connection.id();
            if let Err(err) = manager.release(connection) {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %err,
                    "Failed to release connection"
                );
            }
        };

        let body = FramedBody::new(connection, disposition.framing);
        let mut reader = AutoReleaseReader::new(body, on_release);
        if disposition.framing == BodyFraming::None {
            if let Err(e) = reader.read(&mut [0u8; 1]) {
                tracing::trace!(error = %e, "Empty body release failed");
            }
        }

        Self {
            reader,
            disposition,
            trailers,
        }
    }

    /// How the body is delimited
    #[must_use]
    pub fn framing(&self) -> BodyFraming {
        self.disposition.framing
    }

    /// Framing and persistence decided for this response
    #[must_use]
    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    /// Whether the connection has been handed back
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.reader.is_released()
    }

    /// How the body ended, once released
    #[must_use]
    pub fn outcome(&self) -> Option<ReleaseOutcome> {
        self.reader.outcome()
    }

    /// Drain the rest of the body and release the connection
    ///
    /// # Errors
    ///
    /// The read error that stopped draining; the connection is then
    /// released as non-reusable.
    pub fn close(&mut self) -> io::Result<()> {
        self.reader.close()
    }

    /// Release the connection without draining; it will not be reused
    pub fn abort(&mut self) {
        self.reader.abort();
    }

    /// Trailer fields, available once a chunked body has been read
    #[must_use]
    pub fn trailers(&self) -> Vec<Header> {
        self.trailers.lock().clone()
    }

    /// Value of the first trailer with the given name
    #[must_use]
    pub fn trailer(&self, name: &str) -> Option<String> {
        find_header(&self.trailers.lock(), name).map(|header| header.value().to_string())
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("disposition", &self.disposition)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framed_body_selection() {
        let source: &[u8] = b"5\r\nhello\r\n0\r\nX-Check: ok\r\n\r\nrest";
        let mut body = FramedBody::new(source, BodyFraming::Chunked);
        let mut out = String::new();
        body.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
        assert_eq!(body.trailers(), &[Header::new("X-Check", "ok")]);
        assert_eq!(body.into_inner(), b"rest");
    }

    #[test]
    fn test_empty_body_reads_nothing() {
        let source: &[u8] = b"not a body";
        let mut body = FramedBody::new(source, BodyFraming::None);
        let mut out = Vec::new();
        body.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(body.into_inner(), b"not a body");
    }

    #[test]
    fn test_until_close_reads_everything() {
        let source: &[u8] = b"all of it";
        let mut body = FramedBody::new(source, BodyFraming::UntilClose);
        let mut out = Vec::new();
        body.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"all of it");
    }
}

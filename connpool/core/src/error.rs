//! Error Types
//!
//! One error enum per concern, aggregated by [`Error`] for callers that drive
//! a whole exchange:
//!
//! - [`PoolError`]: acquisition and release failures (capacity, shutdown,
//!   misuse). These never close or corrupt a connection.
//! - [`ConnectError`]: transport-level connect failures. The leased slot is
//!   released and the connection discarded.
//! - [`FramingError`]: malformed message bodies. Framing readers implement
//!   `std::io::Read`, so these travel inside `io::Error`; the connection is
//!   always closed afterwards.
//! - [`ConfigError`](crate::config::ConfigError): configuration loading.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::route::Route;

/// Errors raised by connection managers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The acquisition deadline elapsed while capacity was saturated
    #[error("timed out after {waited:?} waiting for a connection to {route}")]
    Timeout {
        /// Route the caller asked for
        route: Route,
        /// How long the caller waited
        waited: Duration,
    },

    /// A blocked acquisition was interrupted externally
    #[error("acquisition of a connection to {route} was interrupted")]
    Interrupted {
        /// Route the caller asked for
        route: Route,
    },

    /// The manager has been shut down
    #[error("connection manager has been shut down")]
    Shutdown,

    /// Double release, release of a foreign connection, or similar misuse
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl PoolError {
    /// Whether the caller may retry the same acquisition later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors raised while opening a transport
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The transport did not connect within its own timeout
    #[error("connect to {route} timed out after {timeout:?}")]
    Timeout {
        /// Route being connected
        route: Route,
        /// Connect timeout that elapsed
        timeout: Duration,
    },

    /// The connect attempt failed outright
    #[error("connect to {route} failed: {source}")]
    Io {
        /// Route being connected
        route: Route,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },
}

/// Malformed HTTP/1.1 message framing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// The chunk-size line could not be parsed
    #[error("invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),

    /// Chunk data was not followed by CRLF
    #[error("CRLF expected at end of chunk")]
    MissingChunkTerminator,

    /// The stream ended in the middle of a chunk or chunk-size line
    #[error("chunked stream ended unexpectedly")]
    UnexpectedEof,

    /// The response status line could not be parsed
    #[error("invalid status line: {0:?}")]
    InvalidStatusLine(String),

    /// A header or trailer line could not be parsed
    #[error("unable to parse header line: {0:?}")]
    MalformedHeader(String),

    /// The stream ended before the declared content length was read
    #[error("premature end of body: expected {expected} bytes, received {received}")]
    IncompleteBody {
        /// Declared content length
        expected: u64,
        /// Bytes received before end of stream
        received: u64,
    },
}

impl FramingError {
    /// Recover the framing error carried by an I/O error, if any
    #[must_use]
    pub fn from_io(err: &io::Error) -> Option<&FramingError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<FramingError>())
    }
}

impl From<FramingError> for io::Error {
    fn from(err: FramingError) -> Self {
        let kind = match err {
            FramingError::UnexpectedEof | FramingError::IncompleteBody { .. } => {
                io::ErrorKind::UnexpectedEof
            }
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

/// Any error surfaced by this crate
#[derive(Debug, Error)]
pub enum Error {
    /// Pool acquisition or release failure
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Transport connect failure
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Malformed message framing
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// Configuration failure
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Other I/O failure on a connection
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_error_survives_io_wrapping() {
        let io_err: io::Error = FramingError::MissingChunkTerminator.into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(
            FramingError::from_io(&io_err),
            Some(&FramingError::MissingChunkTerminator)
        );
    }

    #[test]
    fn test_eof_kinds() {
        let io_err: io::Error = FramingError::IncompleteBody {
            expected: 10,
            received: 3,
        }
        .into();
        assert_eq!(io_err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_plain_io_error_has_no_framing_error() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        assert!(FramingError::from_io(&io_err).is_none());
    }

    #[test]
    fn test_only_timeout_is_retryable() {
        let route = Route::http("host1", 80);
        assert!(PoolError::Timeout {
            route: route.clone(),
            waited: Duration::from_millis(100)
        }
        .is_retryable());
        assert!(!PoolError::Interrupted { route }.is_retryable());
        assert!(!PoolError::Shutdown.is_retryable());
    }
}

//! HTTP/1.1 Message Framing
//!
//! Byte-exact readers and writers for message bodies. Each reader stops at
//! the logical end of its body and never consumes bytes belonging to the
//! next message, which is what makes the connection safe to reuse.
//!
//! - [`parser`]: line reader and header-block parser
//! - [`chunked`]: chunked transfer coding, both directions
//! - [`length`]: Content-Length delimited bodies
//! - [`auto_release`]: exactly-once release when a body ends
//!
//! Framing errors are reported as [`FramingError`](crate::error::FramingError)
//! inside `std::io::Error`, since every reader here implements `Read`.

pub mod auto_release;
pub mod chunked;
pub mod length;
pub mod parser;

pub use auto_release::{AutoReleaseReader, ReleaseOutcome};
pub use chunked::{ChunkedDecoder, ChunkedEncoder};
pub use length::ContentLengthReader;
pub use parser::{find_header, find_headers, parse_header_lines, parse_headers, read_line, Header};

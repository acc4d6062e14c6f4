//! HTTP line and header-block parsing
//!
//! Lines are decoded byte-for-char (ISO-8859-1), so any byte sequence a
//! peer sends survives the round trip into a `String`.

use std::io::{self, BufRead};

use crate::error::FramingError;

/// A single header or trailer field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    /// Create a header
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Field name as received
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field value with surrounding whitespace removed
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether the field has the given name (case-insensitive)
    #[must_use]
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Comma-separated tokens of the value, trimmed, empty ones skipped
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.value
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

/// First header with the given name
#[must_use]
pub fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a Header> {
    headers.iter().find(|header| header.is(name))
}

/// Every header with the given name, in order
pub fn find_headers<'a>(headers: &'a [Header], name: &'a str) -> impl Iterator<Item = &'a Header> {
    headers.iter().filter(move |header| header.is(name))
}

pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Read one line, without its line terminator
///
/// The terminating `\n` and a single `\r` before it are removed. Returns
/// `None` when the stream is already at end of input; a final line without
/// a terminator is returned as is.
///
/// # Errors
///
/// Propagates read errors from the underlying stream.
pub fn read_line<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(latin1(&buf)))
}

/// Parse a header block from already separated lines
///
/// Stops at the first blank or whitespace-only line. Lines starting with a
/// space or tab continue the previous field.
///
/// # Errors
///
/// `FramingError::MalformedHeader` for a line without a colon, or a
/// continuation line with nothing to continue.
pub fn parse_header_lines<I, S>(lines: I) -> Result<Vec<Header>, FramingError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut headers: Vec<Header> = Vec::new();
    for line in lines {
        let line = line.as_ref();
        if line.trim().is_empty() {
            break;
        }

        if line.starts_with([' ', '\t']) {
            let Some(last) = headers.last_mut() else {
                return Err(FramingError::MalformedHeader(line.to_string()));
            };
            let continuation = line.trim();
            if !last.value.is_empty() {
                last.value.push(' ');
            }
            last.value.push_str(continuation);
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(FramingError::MalformedHeader(line.to_string()));
        };
        headers.push(Header::new(name.trim(), value.trim()));
    }
    Ok(headers)
}

/// Read a header block from a stream
///
/// Reads lines until a blank or whitespace-only line, or end of input.
///
/// # Errors
///
/// Read errors are propagated; malformed lines surface as an `io::Error`
/// carrying `FramingError::MalformedHeader`.
pub fn parse_headers<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Vec<Header>> {
    let mut lines = Vec::new();
    while let Some(line) = read_line(reader)? {
        let blank = line.trim().is_empty();
        lines.push(line);
        if blank {
            break;
        }
    }
    parse_header_lines(lines).map_err(io::Error::from)
}

//! Message Completion and Keep-Alive Policy
//!
//! Decides, from a response head and the request that produced it, how the
//! body is delimited and whether the connection can carry another exchange
//! once the body has been consumed.
//!
//! # Framing
//!
//! | Condition | Framing |
//! |-----------|---------|
//! | `HEAD` request, or 1xx / 204 / 304 status | none |
//! | `Transfer-Encoding` lists `chunked` | chunked |
//! | a valid `Content-Length` | length |
//! | otherwise | read until close |
//!
//! # Persistence
//!
//! HTTP/1.1 and later are persistent unless the connection header carries
//! `close`; HTTP/1.0 and earlier close unless it carries `keep-alive`.
//! Through a non-transparent proxy, `Proxy-Connection` is consulted before
//! `Connection`. A request that asked for `Connection: close` and any
//! read-until-close body always end the connection.

use std::fmt;
use std::io::{self, BufRead};
use std::str::FromStr;

use crate::error::FramingError;
use crate::framing::parser::{find_headers, parse_headers, read_line, Header};
use crate::route::Route;

// =============================================================================
// Message Heads
// =============================================================================

/// HTTP protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HttpVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl HttpVersion {
    /// HTTP/1.0
    pub const HTTP_1_0: Self = Self { major: 1, minor: 0 };
    /// HTTP/1.1
    pub const HTTP_1_1: Self = Self { major: 1, minor: 1 };
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

impl FromStr for HttpVersion {
    type Err = FramingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FramingError::InvalidStatusLine(s.to_string());
        let numbers = s
            .trim()
            .strip_prefix("HTTP/")
            .ok_or_else(invalid)?;
        let (major, minor) = numbers.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// Status line and headers of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Protocol version of the response
    pub version: HttpVersion,
    /// Status code
    pub status: u16,
    /// Reason phrase
    pub reason: String,
    /// Header fields, in order
    pub headers: Vec<Header>,
}

impl ResponseHead {
    /// Create a head with no headers
    pub fn new(version: HttpVersion, status: u16) -> Self {
        Self {
            version,
            status,
            reason: String::new(),
            headers: Vec::new(),
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    /// Read a status line and header block
    ///
    /// Blank lines before the status line are skipped.
    ///
    /// # Errors
    ///
    /// `FramingError::InvalidStatusLine` or `FramingError::MalformedHeader`
    /// inside an `io::Error`, `FramingError::UnexpectedEof` if the stream
    /// ends before a status line; read errors are propagated.
    pub fn read_from<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let status_line = loop {
            match read_line(reader)? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => break line,
                None => return Err(FramingError::UnexpectedEof.into()),
            }
        };
        let mut head = Self::parse_status_line(&status_line)?;
        head.headers = parse_headers(reader)?;
        Ok(head)
    }

    fn parse_status_line(line: &str) -> Result<Self, FramingError> {
        let invalid = || FramingError::InvalidStatusLine(line.to_string());
        let mut parts = line.trim().splitn(3, ' ');
        let version = parts.next().ok_or_else(invalid)?.parse()?;
        let status = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(invalid)?;
        let reason = parts.next().unwrap_or_default().trim().to_string();
        Ok(Self {
            version,
            status,
            reason,
            headers: Vec::new(),
        })
    }
}

/// What the request side contributes to the decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Request method
    pub method: String,
    /// The request carried `Connection: close`
    pub request_connection_close: bool,
    /// Messages pass through a non-transparent proxy
    pub via_proxy: bool,
}

impl RequestContext {
    /// Context for a direct request with the given method
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            request_connection_close: false,
            via_proxy: false,
        }
    }

    /// Context for a request sent over `route`
    pub fn for_route(method: impl Into<String>, route: &Route) -> Self {
        Self::new(method).with_via_proxy(route.has_visible_proxy())
    }

    /// Record that the request asked to close the connection
    #[must_use]
    pub fn with_connection_close(mut self, close: bool) -> Self {
        self.request_connection_close = close;
        self
    }

    /// Record whether a non-transparent proxy is in the path
    #[must_use]
    pub fn with_via_proxy(mut self, via_proxy: bool) -> Self {
        self.via_proxy = via_proxy;
        self
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// How a response body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyFraming {
    /// No body follows the head
    None,
    /// Chunked transfer coding
    Chunked,
    /// Exactly this many bytes
    Length(u64),
    /// Everything until the peer closes
    UntilClose,
}

/// Framing plus what happens to the connection after the body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Disposition {
    /// Body framing
    pub framing: BodyFraming,
    /// Whether the connection may be reused once the body is consumed
    pub persistent: bool,
}

/// Effective Content-Length
///
/// The first value that parses as a non-negative integer wins; values that
/// do not parse are skipped.
#[must_use]
pub fn content_length(headers: &[Header]) -> Option<u64> {
    find_headers(headers, "Content-Length").find_map(|header| header.value().trim().parse().ok())
}

/// Whether any `Transfer-Encoding` token is `chunked`
#[must_use]
pub fn is_chunked(headers: &[Header]) -> bool {
    find_headers(headers, "Transfer-Encoding")
        .flat_map(Header::tokens)
        .any(|token| token.eq_ignore_ascii_case("chunked"))
}

/// Whether a response can carry a body at all
#[must_use]
pub fn can_have_body(status: u16, ctx: &RequestContext) -> bool {
    !(ctx.method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304)
}

/// Pick the body framing for a response
#[must_use]
pub fn body_framing(head: &ResponseHead, ctx: &RequestContext) -> BodyFraming {
    if !can_have_body(head.status, ctx) {
        BodyFraming::None
    } else if is_chunked(&head.headers) {
        BodyFraming::Chunked
    } else if let Some(length) = content_length(&head.headers) {
        BodyFraming::Length(length)
    } else {
        BodyFraming::UntilClose
    }
}

fn connection_tokens<'a>(
    head: &'a ResponseHead,
    ctx: &RequestContext,
) -> impl Iterator<Item = &'a str> {
    let proxy_headers = ctx.via_proxy
        && find_headers(&head.headers, "Proxy-Connection")
            .next()
            .is_some();
    let name = if proxy_headers {
        "Proxy-Connection"
    } else {
        "Connection"
    };
    find_headers(&head.headers, name).flat_map(Header::tokens)
}

/// Whether the connection survives the exchange, given the chosen framing
#[must_use]
pub fn is_persistent(head: &ResponseHead, ctx: &RequestContext, framing: BodyFraming) -> bool {
    if ctx.request_connection_close || framing == BodyFraming::UntilClose {
        return false;
    }

    let mut close = false;
    let mut keep_alive = false;
    for token in connection_tokens(head, ctx) {
        if token.eq_ignore_ascii_case("close") {
            close = true;
        } else if token.eq_ignore_ascii_case("keep-alive") {
            keep_alive = true;
        }
    }

    if close {
        false
    } else if head.version >= HttpVersion::HTTP_1_1 {
        true
    } else {
        keep_alive
    }
}

/// Framing and persistence for a response
#[must_use]
pub fn disposition(head: &ResponseHead, ctx: &RequestContext) -> Disposition {
    let framing = body_framing(head, ctx);
    let persistent = is_persistent(head, ctx, framing);
    tracing::trace!(
        status = head.status,
        version = %head.version,
        ?framing,
        persistent,
        "Response disposition"
    );
    Disposition {
        framing,
        persistent,
    }
}

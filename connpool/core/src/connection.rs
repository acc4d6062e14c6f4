//! Connections and Transports
//!
//! A [`Connection`] is the unit the pool hands out: a route-bound handle that
//! owns at most one open byte stream. The stream itself comes from a
//! [`TransportFactory`] and is opened lazily by the caller, never while a
//! pool lock is held.
//!
//! A connection is always in exactly one place: a manager's free list
//! (`Idle`), the hands of one caller (`Leased`), or nowhere (`Closed`).
//! Exclusive ownership of the leased value is what keeps two callers from
//! sharing a stream.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ConnectError;
use crate::route::Route;

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Unique identifier for a connection manager
///
/// Every connection records the manager that created it, so a manager can
/// refuse connections that belong to someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagerId(u64);

impl ManagerId {
    /// Create a new unique manager ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ManagerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "manager-{}", self.0)
    }
}

// =============================================================================
// Transport Seam
// =============================================================================

/// An open, blocking byte stream to a route
pub trait Transport: Read + Write + Send {
    /// Whether the remote end has closed the stream
    ///
    /// Must not block and must not consume data.
    fn is_peer_closed(&self) -> bool;

    /// Close the stream
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the shutdown fails.
    fn close(&mut self) -> io::Result<()>;
}

/// Opens transports for routes
pub trait TransportFactory: Send + Sync {
    /// Connect to the route's connect target within `timeout`
    ///
    /// # Errors
    ///
    /// Returns `ConnectError::Timeout` when the deadline elapses and
    /// `ConnectError::Io` for any other failure.
    fn connect(&self, route: &Route, timeout: Duration)
        -> Result<Box<dyn Transport>, ConnectError>;
}

/// Plain TCP transport
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Wrap an already connected stream
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn is_peer_closed(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut peeked = [0u8; 1];
        let closed = match self.stream.peek(&mut peeked) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => e.kind() != io::ErrorKind::WouldBlock,
        };
        if self.stream.set_nonblocking(false).is_err() {
            return true;
        }
        closed
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// Connects over TCP to `route.connect_target()`
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransportFactory {
    nodelay: bool,
}

impl TcpTransportFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable Nagle's algorithm on new streams
    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl TransportFactory for TcpTransportFactory {
    fn connect(
        &self,
        route: &Route,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let io_error = |source: io::Error| ConnectError::Io {
            route: route.clone(),
            source,
        };

        let addrs = route.connect_target().to_socket_addrs().map_err(io_error)?;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(self.nodelay).map_err(io_error)?;
                    tracing::trace!(route = %route, addr = %addr, "TCP connection established");
                    return Ok(Box::new(TcpTransport::new(stream)));
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(ConnectError::Timeout {
                        route: route.clone(),
                        timeout,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(io_error(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved")
        })))
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Where a connection currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// In a manager's free list
    Idle,
    /// Exclusively held by one caller
    Leased,
    /// Terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Leased => write!(f, "leased"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A route-bound, reusable connection handle
pub struct Connection {
    id: ConnectionId,
    owner: ManagerId,
    route: Route,
    stream: Option<BufReader<Box<dyn Transport>>>,
    state: ConnectionState,
    created_at: Instant,
    opened_at: Option<Instant>,
    leased_at: Option<Instant>,
    last_released_at: Option<Instant>,
    reusable: bool,
}

impl Connection {
    pub(crate) fn new(owner: ManagerId, route: Route) -> Self {
        Self {
            id: ConnectionId::new(),
            owner,
            route,
            stream: None,
            state: ConnectionState::Idle,
            created_at: Instant::now(),
            opened_at: None,
            leased_at: None,
            last_released_at: None,
            reusable: true,
        }
    }

    /// Connection ID
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Manager that created this connection
    #[must_use]
    pub fn owner(&self) -> ManagerId {
        self.owner
    }

    /// Route the connection is bound to
    #[must_use]
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// When the handle was created
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the transport was opened
    #[must_use]
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// When the current lease began
    #[must_use]
    pub fn leased_at(&self) -> Option<Instant> {
        self.leased_at
    }

    /// When the connection was last returned to a free list
    #[must_use]
    pub fn last_released_at(&self) -> Option<Instant> {
        self.last_released_at
    }

    /// Whether the transport is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether the remote end has closed an open transport
    ///
    /// A connection with no transport counts as closed.
    #[must_use]
    pub fn is_peer_closed(&self) -> bool {
        self.stream
            .as_ref()
            .map_or(true, |stream| stream.get_ref().is_peer_closed())
    }

    /// Whether the connection may be pooled on release
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Mark whether the connection may be pooled on release
    ///
    /// Clear this after a framing error, a non-persistent response, or any
    /// exchange that left the stream in an unknown position.
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    /// Open the transport if it is not already open
    ///
    /// # Errors
    ///
    /// Returns the factory's `ConnectError`. A closed connection cannot be
    /// reopened.
    pub fn open(
        &mut self,
        factory: &dyn TransportFactory,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        if self.stream.is_some() {
            return Ok(());
        }
        if self.state == ConnectionState::Closed {
            return Err(ConnectError::Io {
                route: self.route.clone(),
                source: io::Error::new(io::ErrorKind::NotConnected, "connection is closed"),
            });
        }
        let transport = factory.connect(&self.route, timeout)?;
        self.attach(transport);
        Ok(())
    }

    /// Use an already open transport, closing any current one
    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        self.shutdown_stream();
        self.stream = Some(BufReader::new(transport));
        self.opened_at = Some(Instant::now());
        tracing::trace!(connection_id = %self.id, route = %self.route, "Transport attached");
    }

    /// Close the transport; the connection will never be reused
    ///
    /// # Errors
    ///
    /// Returns the transport's close error. The connection is closed either way.
    pub fn close(&mut self) -> io::Result<()> {
        self.state = ConnectionState::Closed;
        self.reusable = false;
        match self.stream.take() {
            Some(mut stream) => stream.get_mut().close(),
            None => Ok(()),
        }
    }

    /// How long the connection has been idle
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.last_released_at
            .map(|released| now.saturating_duration_since(released))
    }

    /// How long the current lease has lasted
    #[must_use]
    pub fn lease_age(&self, now: Instant) -> Option<Duration> {
        self.leased_at
            .map(|leased| now.saturating_duration_since(leased))
    }

    pub(crate) fn mark_leased(&mut self, now: Instant) {
        self.state = ConnectionState::Leased;
        self.leased_at = Some(now);
        self.reusable = true;
    }

    pub(crate) fn mark_idle(&mut self, now: Instant) {
        self.state = ConnectionState::Idle;
        self.leased_at = None;
        self.last_released_at = Some(now);
    }

    /// Close the transport and bind the handle to another route
    pub(crate) fn rebind(&mut self, route: Route) {
        self.shutdown_stream();
        tracing::debug!(
            connection_id = %self.id,
            from = %self.route,
            to = %route,
            "Rebinding connection"
        );
        self.route = route;
    }

    /// Drop the transport without closing it; the peer already has
    pub(crate) fn forget_transport(&mut self) {
        self.state = ConnectionState::Closed;
        self.reusable = false;
        self.opened_at = None;
        drop(self.stream.take());
    }

    fn shutdown_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.get_mut().close() {
                tracing::trace!(connection_id = %self.id, error = %e, "Transport close failed");
            }
        }
        self.opened_at = None;
    }

    fn stream_mut(&mut self) -> io::Result<&mut BufReader<Box<dyn Transport>>> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is not open"))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown_stream();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("route", &self.route)
            .field("state", &self.state)
            .field("open", &self.is_open())
            .field("reusable", &self.reusable)
            .finish_non_exhaustive()
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream_mut()?.read(buf)
    }
}

impl BufRead for Connection {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.stream_mut()?.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        if let Some(stream) = self.stream.as_mut() {
            stream.consume(amt);
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream_mut()?.get_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream_mut()?.get_mut().flush()
    }
}

//! Connection Managers
//!
//! A [`ConnectionManager`] leases [`Connection`]s for routes and takes them
//! back when an exchange ends. Two implementations are provided:
//!
//! - [`PoolingConnectionManager`]: bounded per route and globally, with
//!   blocking acquisition, idle sweeps and shutdown
//! - [`SingleConnectionManager`]: a single reusable slot
//!
//! [`ManagerRegistry`] shuts down many managers at once, and
//! [`IdleConnectionReaper`] sweeps them periodically from a background
//! thread.
//!
//! # Blocking
//!
//! Acquisition blocks according to a [`WaitPolicy`]. A blocked acquisition
//! can be cancelled from another thread through an [`InterruptToken`].
//!
//! Managers never perform network I/O while holding their internal lock:
//! transports are opened by the caller after acquisition (see
//! [`ConnectionManager::acquire_connected`]) and closed after the lock is
//! released.

pub mod manager;
pub mod reaper;
pub mod registry;
pub mod single;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::connection::{Connection, ManagerId, TransportFactory};
use crate::error::{Error, PoolError};
use crate::route::Route;

pub use manager::PoolingConnectionManager;
pub use reaper::{IdleConnectionReaper, ReaperSettings};
pub use registry::ManagerRegistry;
pub use single::SingleConnectionManager;

// =============================================================================
// Wait Policy
// =============================================================================

/// How long an acquisition may block when capacity is saturated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WaitPolicy {
    /// Fail with `PoolError::Timeout` without waiting
    Immediate,
    /// Wait at most this long
    Bounded(Duration),
    /// Wait until a connection frees up, interruption or shutdown
    #[default]
    Indefinite,
}

impl WaitPolicy {
    /// Interpret a millisecond timeout: negative waits forever, zero fails fast
    #[must_use]
    pub fn from_millis(ms: i64) -> Self {
        match u64::try_from(ms) {
            Err(_) => Self::Indefinite,
            Ok(0) => Self::Immediate,
            Ok(ms) => Self::Bounded(Duration::from_millis(ms)),
        }
    }

    /// Deadline for an acquisition that started at `start`
    ///
    /// `None` means no deadline.
    #[must_use]
    pub fn deadline(&self, start: Instant) -> Option<Instant> {
        match self {
            Self::Immediate => Some(start),
            Self::Bounded(timeout) => start.checked_add(*timeout),
            Self::Indefinite => None,
        }
    }
}

// =============================================================================
// Interruption
// =============================================================================

type Wakeup = Box<dyn FnOnce() + Send>;

struct TokenInner {
    interrupted: AtomicBool,
    next_key: AtomicU64,
    wakeups: Mutex<HashMap<u64, Wakeup>>,
}

/// Cancels blocked acquisitions from another thread
///
/// Clones share state. Once interrupted, a token stays interrupted: every
/// acquisition using it fails with `PoolError::Interrupted`, including all
/// acquisitions blocked on it at that moment.
#[derive(Clone)]
pub struct InterruptToken {
    inner: Arc<TokenInner>,
}

impl InterruptToken {
    /// Create a token that has not been interrupted
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                interrupted: AtomicBool::new(false),
                next_key: AtomicU64::new(0),
                wakeups: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Interrupt every acquisition blocked on this token
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        let wakeups = std::mem::take(&mut *self.inner.wakeups.lock());
        for wakeup in wakeups.into_values() {
            wakeup();
        }
    }

    /// Whether `interrupt` has been called
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Install the wakeup for a waiter that is about to block
    ///
    /// Returns the key to pass to [`clear`](Self::clear), or `None`,
    /// without installing, if the token is already interrupted.
    pub(crate) fn register(&self, wakeup: Wakeup) -> Option<u64> {
        let mut wakeups = self.inner.wakeups.lock();
        if self.is_interrupted() {
            return None;
        }
        let key = self.inner.next_key.fetch_add(1, Ordering::SeqCst);
        wakeups.insert(key, wakeup);
        Some(key)
    }

    /// Remove one waiter's wakeup once it stops blocking
    pub(crate) fn clear(&self, key: u64) {
        self.inner.wakeups.lock().remove(&key);
    }

    fn pending(&self) -> usize {
        self.inner.wakeups.lock().len()
    }
}

impl Default for InterruptToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InterruptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptToken")
            .field("interrupted", &self.is_interrupted())
            .field("waiting", &self.pending())
            .finish()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of a manager's bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Connections held by callers
    pub leased: usize,
    /// Connections waiting in free lists
    pub idle: usize,
    /// `leased + idle`
    pub total: usize,
    /// Blocked acquisitions
    pub waiting: usize,
    /// Connections created since start
    pub created: u64,
    /// Connections closed since start
    pub closed: u64,
    /// Slots reclaimed from other routes or from abandoned leases
    pub reclaimed: u64,
    /// Acquisitions that timed out
    pub timeouts: u64,
}

/// Snapshot of one route's bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStats {
    /// Connections held by callers
    pub leased: usize,
    /// Connections in the route's free list
    pub idle: usize,
    /// Blocked acquisitions for the route
    pub waiting: usize,
    /// Route limit
    pub max: usize,
}

// =============================================================================
// Manager Trait
// =============================================================================

/// Leases connections for routes and takes them back
pub trait ConnectionManager: Send + Sync {
    /// Unique manager ID, recorded on every connection it creates
    fn id(&self) -> ManagerId;

    /// Lease a connection for `route`, blocking per `wait`
    ///
    /// The returned connection may not be open yet; see
    /// [`acquire_connected`](Self::acquire_connected).
    ///
    /// # Errors
    ///
    /// `PoolError::Timeout` when the wait policy runs out,
    /// `PoolError::Interrupted` when `interrupt` fires, `PoolError::Shutdown`
    /// once the manager is shut down, `PoolError::InvalidOperation` for
    /// requests the manager cannot serve by construction.
    fn acquire_interruptible(
        &self,
        route: &Route,
        wait: WaitPolicy,
        interrupt: &InterruptToken,
    ) -> Result<Connection, PoolError>;

    /// Lease a connection for `route`, blocking per `wait`
    ///
    /// # Errors
    ///
    /// As for [`acquire_interruptible`](Self::acquire_interruptible), except
    /// that it cannot be interrupted.
    fn acquire(&self, route: &Route, wait: WaitPolicy) -> Result<Connection, PoolError> {
        self.acquire_interruptible(route, wait, &InterruptToken::new())
    }

    /// Lease a connection and make sure its transport is open
    ///
    /// The transport is opened after the lease is granted, outside any
    /// manager lock. If opening fails the connection is released straight
    /// away, so the slot is not lost.
    ///
    /// # Errors
    ///
    /// `Error::Pool` from acquisition, `Error::Connect` from the factory.
    fn acquire_connected(
        &self,
        route: &Route,
        wait: WaitPolicy,
        factory: &dyn TransportFactory,
        connect_timeout: Duration,
    ) -> Result<Connection, Error> {
        let mut connection = self.acquire(route, wait)?;
        if let Err(err) = connection.open(factory, connect_timeout) {
            connection.set_reusable(false);
            if let Err(release_err) = self.release(connection) {
                tracing::warn!(
                    route = %route,
                    error = %release_err,
                    "Failed to release connection after connect failure"
                );
            }
            return Err(err.into());
        }
        Ok(connection)
    }

    /// Return a leased connection
    ///
    /// Open, reusable connections go back to the free list; anything else
    /// is closed.
    ///
    /// # Errors
    ///
    /// `PoolError::InvalidOperation` for a connection this manager did not
    /// lease out, or one that was already returned or reclaimed.
    fn release(&self, connection: Connection) -> Result<(), PoolError>;

    /// Close free connections idle for longer than `idle_timeout`
    ///
    /// Returns the number of connections closed.
    fn close_idle_connections(&self, idle_timeout: Duration) -> usize;

    /// Forget leases older than `max_age` and free their slots
    ///
    /// Returns the number of leases reclaimed. A later release of such a
    /// connection fails with `PoolError::InvalidOperation`.
    fn reclaim_abandoned_leases(&self, max_age: Duration) -> usize;

    /// Bookkeeping snapshot
    fn stats(&self) -> PoolStats;

    /// Stop serving acquisitions and close idle connections
    ///
    /// Blocked acquisitions fail with `PoolError::Shutdown`. Leased
    /// connections are closed when released. Calling it again does nothing.
    fn shutdown(&self);

    /// Whether [`shutdown`](Self::shutdown) has run
    fn is_shutdown(&self) -> bool;
}

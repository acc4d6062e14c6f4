//! Route-partitioned pooling manager
//!
//! All bookkeeping lives in one `parking_lot::Mutex<PoolState>`. Each blocked
//! acquisition parks on its own `Condvar`, queued FIFO both per route and
//! globally, so a release can wake exactly the waiter that can use it:
//! a waiter for the same route first, otherwise the oldest waiter whose
//! route still has room under its limit.
//!
//! # Acquisition order
//!
//! 1. Fail with `Shutdown` once shut down
//! 2. Reuse the most recently released free connection for the route
//! 3. Create a new connection if the route and global limits allow it
//! 4. If only the global limit is hit, close the least recently released
//!    idle connection of another route and take its slot
//! 5. Otherwise wait, then start over
//!
//! Connections removed from the pool (reclaimed, swept, discarded or left
//! over at shutdown) are closed after the lock has been dropped.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::registry::ManagerRegistry;
use super::{ConnectionManager, InterruptToken, PoolStats, RouteStats, WaitPolicy};
use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionId, ManagerId};
use crate::error::PoolError;
use crate::route::Route;

// =============================================================================
// Internal State
// =============================================================================

/// A blocked acquisition
struct Waiter {
    seq: u64,
    route: Route,
    cond: Condvar,
    notified: AtomicBool,
}

struct Lease {
    route: Route,
    leased_at: Instant,
}

/// A granted lease, plus the connection evicted to make room for it
struct Granted {
    connection: Connection,
    victim: Option<Connection>,
    reused: bool,
}

struct PoolState {
    max_total: usize,
    default_max_per_route: usize,
    route_limits: HashMap<Route, usize>,

    /// Front is the most recently released connection
    free: HashMap<Route, VecDeque<Connection>>,
    leases: HashMap<ConnectionId, Lease>,
    /// Leased plus free, per route
    counts: HashMap<Route, usize>,
    total: usize,

    route_waiters: HashMap<Route, VecDeque<Arc<Waiter>>>,
    waiters: VecDeque<Arc<Waiter>>,
    next_seq: u64,

    shutdown: bool,

    created: u64,
    closed: u64,
    reclaimed: u64,
    timeouts: u64,
}

impl PoolState {
    fn new(config: &PoolConfig) -> Self {
        Self {
            max_total: config.max_total,
            default_max_per_route: config.default_max_per_route,
            route_limits: config.route_limit_map(),
            free: HashMap::new(),
            leases: HashMap::new(),
            counts: HashMap::new(),
            total: 0,
            route_waiters: HashMap::new(),
            waiters: VecDeque::new(),
            next_seq: 0,
            shutdown: false,
            created: 0,
            closed: 0,
            reclaimed: 0,
            timeouts: 0,
        }
    }

    fn max_for(&self, route: &Route) -> usize {
        self.route_limits
            .get(route)
            .copied()
            .unwrap_or(self.default_max_per_route)
    }

    fn count(&self, route: &Route) -> usize {
        self.counts.get(route).copied().unwrap_or(0)
    }

    fn has_room(&self, route: &Route) -> bool {
        self.count(route) < self.max_for(route)
    }

    fn idle_count(&self) -> usize {
        self.free.values().map(VecDeque::len).sum()
    }

    /// Drop one connection of `route` from the counts
    fn forget(&mut self, route: &Route) {
        if let Some(count) = self.counts.get_mut(route) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(route);
            }
        }
        self.total = self.total.saturating_sub(1);
    }

    fn try_lease(&mut self, owner: ManagerId, route: &Route, now: Instant) -> Option<Granted> {
        if let Some(mut connection) = self.free.get_mut(route).and_then(VecDeque::pop_front) {
            if self.free.get(route).is_some_and(VecDeque::is_empty) {
                self.free.remove(route);
            }
            connection.mark_leased(now);
            self.record_lease(&connection, now);
            return Some(Granted {
                connection,
                victim: None,
                reused: true,
            });
        }

        if !self.has_room(route) {
            return None;
        }
        let victim = if self.total < self.max_total {
            None
        } else {
            Some(self.evict_oldest_idle()?)
        };

        let mut connection = Connection::new(owner, route.clone());
        connection.mark_leased(now);
        *self.counts.entry(route.clone()).or_insert(0) += 1;
        self.total += 1;
        self.created += 1;
        self.record_lease(&connection, now);
        Some(Granted {
            connection,
            victim,
            reused: false,
        })
    }

    fn record_lease(&mut self, connection: &Connection, now: Instant) {
        self.leases.insert(
            connection.id(),
            Lease {
                route: connection.route().clone(),
                leased_at: now,
            },
        );
    }

    /// Remove the least recently released idle connection of any route
    fn evict_oldest_idle(&mut self) -> Option<Connection> {
        let route = self
            .free
            .iter()
            .filter_map(|(route, list)| list.back().map(|c| (route, c.last_released_at())))
            .min_by_key(|(_, released)| *released)
            .map(|(route, _)| route.clone())?;

        let list = self.free.get_mut(&route)?;
        let victim = list.pop_back()?;
        if list.is_empty() {
            self.free.remove(&route);
        }
        self.forget(&route);
        self.reclaimed += 1;
        self.closed += 1;
        Some(victim)
    }

    /// Remove free connections matching `predicate`
    fn remove_free(&mut self, mut predicate: impl FnMut(&Connection) -> bool) -> Vec<Connection> {
        let mut removed = Vec::new();
        for list in self.free.values_mut() {
            let (matched, kept): (VecDeque<_>, VecDeque<_>) =
                list.drain(..).partition(|connection| predicate(connection));
            *list = kept;
            removed.extend(matched);
        }
        self.free.retain(|_, list| !list.is_empty());

        for connection in &removed {
            self.forget(connection.route());
            self.closed += 1;
        }
        for connection in &removed {
            self.wake_one(connection.route());
        }
        removed
    }

    fn enqueue(&mut self, waiter: &Arc<Waiter>) {
        fn insert_ordered(queue: &mut VecDeque<Arc<Waiter>>, waiter: &Arc<Waiter>) {
            let pos = queue
                .iter()
                .position(|queued| queued.seq > waiter.seq)
                .unwrap_or(queue.len());
            queue.insert(pos, Arc::clone(waiter));
        }

        insert_ordered(&mut self.waiters, waiter);
        insert_ordered(
            self.route_waiters.entry(waiter.route.clone()).or_default(),
            waiter,
        );
    }

    fn dequeue(&mut self, waiter: &Arc<Waiter>) {
        self.waiters.retain(|queued| !Arc::ptr_eq(queued, waiter));
        if let Some(queue) = self.route_waiters.get_mut(&waiter.route) {
            queue.retain(|queued| !Arc::ptr_eq(queued, waiter));
            if queue.is_empty() {
                self.route_waiters.remove(&waiter.route);
            }
        }
    }

    /// Wake the waiter best placed to use capacity freed on `route`
    ///
    /// Same-route waiters come first; otherwise the oldest waiter whose
    /// route is under its limit.
    fn wake_one(&mut self, route: &Route) -> bool {
        let same_route = self
            .route_waiters
            .get(route)
            .and_then(|queue| queue.front())
            .cloned();
        let waiter = same_route.or_else(|| {
            self.waiters
                .iter()
                .find(|waiter| self.has_room(&waiter.route))
                .cloned()
        });

        match waiter {
            Some(waiter) => {
                self.dequeue(&waiter);
                waiter.notified.store(true, Ordering::SeqCst);
                waiter.cond.notify_one();
                true
            }
            None => false,
        }
    }

    fn wake_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            waiter.notified.store(true, Ordering::SeqCst);
            waiter.cond.notify_one();
        }
        self.route_waiters.clear();
    }
}

struct Shared {
    state: Mutex<PoolState>,
}

fn close_quietly(mut connection: Connection) {
    if let Err(e) = connection.close() {
        tracing::trace!(connection_id = %connection.id(), error = %e, "Close failed");
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Bounded, route-partitioned connection pool
///
/// # Example
///
/// ```no_run
/// use connpool_core::{ConnectionManager, PoolConfig, PoolingConnectionManager, Route, WaitPolicy};
///
/// let manager = PoolingConnectionManager::new(PoolConfig::default().with_max_total(10));
/// let route = Route::http("example.com", 80);
/// let connection = manager.acquire(&route, WaitPolicy::from_millis(500))?;
/// // ... open, write a request, read the response ...
/// manager.release(connection)?;
/// # Ok::<(), connpool_core::PoolError>(())
/// ```
pub struct PoolingConnectionManager {
    id: ManagerId,
    shared: Arc<Shared>,
    registry: Mutex<Option<Weak<ManagerRegistry>>>,
}

impl PoolingConnectionManager {
    /// Create a manager with the given limits
    ///
    /// Limits are taken as given; run [`PoolConfig::validate`] first when
    /// they come from user input.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let id = ManagerId::new();
        tracing::debug!(
            manager_id = %id,
            max_total = config.max_total,
            default_max_per_route = config.default_max_per_route,
            "Created pooling connection manager"
        );
        Self {
            id,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::new(&config)),
            }),
            registry: Mutex::new(None),
        }
    }

    /// Create a manager and register it for [`ManagerRegistry::shutdown_all`]
    ///
    /// The manager unregisters itself when shut down.
    #[must_use]
    pub fn with_registry(config: PoolConfig, registry: &Arc<ManagerRegistry>) -> Arc<Self> {
        let manager = Arc::new(Self::new(config));
        *manager.registry.lock() = Some(Arc::downgrade(registry));
        let shared: Arc<dyn ConnectionManager> = manager.clone();
        registry.register(&shared);
        manager
    }

    /// Global limit
    #[must_use]
    pub fn max_total(&self) -> usize {
        self.shared.state.lock().max_total
    }

    /// Limit for a route
    #[must_use]
    pub fn max_for(&self, route: &Route) -> usize {
        self.shared.state.lock().max_for(route)
    }

    /// Change the global limit
    ///
    /// Lowering it does not close connections; the pool shrinks as they
    /// are released or swept.
    pub fn set_max_total(&self, max: usize) {
        let mut state = self.shared.state.lock();
        state.max_total = max;
        state.wake_all();
    }

    /// Change the limit for routes without an override
    pub fn set_default_max_per_route(&self, max: usize) {
        let mut state = self.shared.state.lock();
        state.default_max_per_route = max;
        state.wake_all();
    }

    /// Override the limit for one route
    pub fn set_max_for_route(&self, route: Route, max: usize) {
        let mut state = self.shared.state.lock();
        state.route_limits.insert(route, max);
        state.wake_all();
    }

    /// Connections (leased and idle) across all routes
    #[must_use]
    pub fn connections_in_pool(&self) -> usize {
        self.shared.state.lock().total
    }

    /// Connections (leased and idle) for one route
    #[must_use]
    pub fn connections_in_pool_for(&self, route: &Route) -> usize {
        self.shared.state.lock().count(route)
    }

    /// Bookkeeping snapshot for one route
    #[must_use]
    pub fn route_stats(&self, route: &Route) -> RouteStats {
        let state = self.shared.state.lock();
        RouteStats {
            leased: state
                .leases
                .values()
                .filter(|lease| &lease.route == route)
                .count(),
            idle: state.free.get(route).map_or(0, VecDeque::len),
            waiting: state.route_waiters.get(route).map_or(0, VecDeque::len),
            max: state.max_for(route),
        }
    }

    /// Drop free connections whose peer has closed them
    ///
    /// Their transports are released without a close call. Returns the
    /// number removed.
    pub fn delete_closed_connections(&self) -> usize {
        let removed = self
            .shared
            .state
            .lock()
            .remove_free(Connection::is_peer_closed);
        let count = removed.len();
        for mut connection in removed {
            connection.forget_transport();
        }
        if count > 0 {
            tracing::debug!(manager_id = %self.id, count, "Deleted closed connections");
        }
        count
    }

    fn grant(&self, granted: Granted, route: &Route) -> Connection {
        if let Some(victim) = granted.victim {
            tracing::debug!(
                manager_id = %self.id,
                connection_id = %victim.id(),
                victim_route = %victim.route(),
                route = %route,
                "Closing idle connection to make room"
            );
            close_quietly(victim);
        }
        tracing::debug!(
            manager_id = %self.id,
            connection_id = %granted.connection.id(),
            route = %route,
            reused = granted.reused,
            "Leased connection"
        );
        granted.connection
    }

    fn leave_waiting(state: &mut PoolState, route: &Route, was_notified: bool) {
        if was_notified {
            state.wake_one(route);
        }
    }
}

impl ConnectionManager for PoolingConnectionManager {
    fn id(&self) -> ManagerId {
        self.id
    }

    fn acquire_interruptible(
        &self,
        route: &Route,
        wait: WaitPolicy,
        interrupt: &InterruptToken,
    ) -> Result<Connection, PoolError> {
        let start = Instant::now();
        let deadline = wait.deadline(start);
        let mut state = self.shared.state.lock();
        let mut waiter: Option<Arc<Waiter>> = None;
        let mut was_notified = false;

        loop {
            if state.shutdown {
                return Err(PoolError::Shutdown);
            }
            if interrupt.is_interrupted() {
                Self::leave_waiting(&mut state, route, was_notified);
                return Err(PoolError::Interrupted {
                    route: route.clone(),
                });
            }

            let now = Instant::now();
            if let Some(granted) = state.try_lease(self.id, route, now) {
                drop(state);
                return Ok(self.grant(granted, route));
            }

            if deadline.is_some_and(|deadline| now >= deadline) {
                state.timeouts += 1;
                Self::leave_waiting(&mut state, route, was_notified);
                let waited = now.saturating_duration_since(start);
                tracing::debug!(
                    manager_id = %self.id,
                    route = %route,
                    waited_ms = waited.as_millis(),
                    "Timed out waiting for connection"
                );
                return Err(PoolError::Timeout {
                    route: route.clone(),
                    waited,
                });
            }

            let current = match &waiter {
                Some(existing) => Arc::clone(existing),
                None => {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    let created = Arc::new(Waiter {
                        seq,
                        route: route.clone(),
                        cond: Condvar::new(),
                        notified: AtomicBool::new(false),
                    });
                    waiter = Some(Arc::clone(&created));
                    created
                }
            };
            current.notified.store(false, Ordering::SeqCst);
            state.enqueue(&current);

            let shared = Arc::downgrade(&self.shared);
            let target = Arc::clone(&current);
            let registered = interrupt.register(Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    let _state = shared.state.lock();
                    target.cond.notify_one();
                }
            }));
            let Some(wakeup_key) = registered else {
                state.dequeue(&current);
                return Err(PoolError::Interrupted {
                    route: route.clone(),
                });
            };

            tracing::trace!(manager_id = %self.id, route = %route, "Waiting for connection");
            match deadline {
                Some(deadline) => {
                    current.cond.wait_until(&mut state, deadline);
                }
                None => current.cond.wait(&mut state),
            }
            interrupt.clear(wakeup_key);
            state.dequeue(&current);
            was_notified = current.notified.swap(false, Ordering::SeqCst);
        }
    }

    fn release(&self, mut connection: Connection) -> Result<(), PoolError> {
        let connection_id = connection.id();
        if connection.owner() != self.id {
            tracing::warn!(
                manager_id = %self.id,
                connection_id = %connection_id,
                owner = %connection.owner(),
                "Rejected release of foreign connection"
            );
            return Err(PoolError::InvalidOperation(format!(
                "{connection_id} was not leased by {}",
                self.id
            )));
        }

        let now = Instant::now();
        let mut state = self.shared.state.lock();
        let Some(lease) = state.leases.remove(&connection_id) else {
            drop(state);
            tracing::warn!(
                manager_id = %self.id,
                connection_id = %connection_id,
                "Rejected release of connection that is not leased"
            );
            return Err(PoolError::InvalidOperation(format!(
                "{connection_id} is not currently leased"
            )));
        };
        let route = lease.route;

        if state.shutdown || !connection.is_open() || !connection.is_reusable() {
            state.forget(&route);
            state.closed += 1;
            if !state.shutdown {
                state.wake_one(&route);
            }
            drop(state);
            tracing::debug!(
                manager_id = %self.id,
                connection_id = %connection_id,
                route = %route,
                "Released connection closed"
            );
            close_quietly(connection);
            return Ok(());
        }

        connection.mark_idle(now);
        state.free.entry(route.clone()).or_default().push_front(connection);
        state.wake_one(&route);
        drop(state);
        tracing::debug!(
            manager_id = %self.id,
            connection_id = %connection_id,
            route = %route,
            "Released connection to pool"
        );
        Ok(())
    }

    fn close_idle_connections(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let removed = self.shared.state.lock().remove_free(|connection| {
            connection
                .idle_for(now)
                .is_some_and(|idle| idle > idle_timeout)
        });

        let count = removed.len();
        for connection in removed {
            close_quietly(connection);
        }
        if count > 0 {
            tracing::debug!(
                manager_id = %self.id,
                count,
                idle_timeout_ms = idle_timeout.as_millis(),
                "Closed idle connections"
            );
        }
        count
    }

    fn reclaim_abandoned_leases(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        let stale: Vec<ConnectionId> = state
            .leases
            .iter()
            .filter(|(_, lease)| now.saturating_duration_since(lease.leased_at) > max_age)
            .map(|(id, _)| *id)
            .collect();

        for connection_id in &stale {
            if let Some(lease) = state.leases.remove(connection_id) {
                state.forget(&lease.route);
                state.reclaimed += 1;
                state.wake_one(&lease.route);
                tracing::warn!(
                    manager_id = %self.id,
                    connection_id = %connection_id,
                    route = %lease.route,
                    "Reclaimed abandoned lease"
                );
            }
        }
        stale.len()
    }

    fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let idle = state.idle_count();
        PoolStats {
            leased: state.leases.len(),
            idle,
            total: state.total,
            waiting: state.waiters.len(),
            created: state.created,
            closed: state.closed,
            reclaimed: state.reclaimed,
            timeouts: state.timeouts,
        }
    }

    fn shutdown(&self) {
        let leftovers: Vec<Connection> = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.wake_all();
            state.remove_free(|_| true)
        };

        let closed = leftovers.len();
        for connection in leftovers {
            close_quietly(connection);
        }

        let registry = self.registry.lock().take().and_then(|weak| weak.upgrade());
        if let Some(registry) = registry {
            registry.unregister(self.id);
        }
        tracing::info!(manager_id = %self.id, closed, "Connection manager shut down");
    }

    fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }
}

impl fmt::Debug for PoolingConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolingConnectionManager")
            .field("id", &self.id)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

//! Single-slot manager
//!
//! Holds at most one connection and hands it to one caller at a time. It
//! never blocks: asking for the connection while it is leased is a usage
//! error. Asking for a different route than the connection is bound to
//! closes its transport and rebinds it.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{ConnectionManager, InterruptToken, PoolStats, WaitPolicy};
use crate::connection::{Connection, ConnectionId, ManagerId};
use crate::error::PoolError;
use crate::route::Route;

#[derive(Default)]
struct SlotState {
    idle: Option<Connection>,
    leased: Option<(ConnectionId, Instant)>,
    shutdown: bool,
    created: u64,
    closed: u64,
    reclaimed: u64,
}

fn close_quietly(mut connection: Connection) {
    if let Err(e) = connection.close() {
        tracing::trace!(connection_id = %connection.id(), error = %e, "Close failed");
    }
}

/// Connection manager with exactly one connection slot
pub struct SingleConnectionManager {
    id: ManagerId,
    always_close: bool,
    state: Mutex<SlotState>,
}

impl SingleConnectionManager {
    /// Create a manager that keeps its connection open between leases
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: ManagerId::new(),
            always_close: false,
            state: Mutex::new(SlotState::default()),
        }
    }

    /// Close the connection after every release
    #[must_use]
    pub fn with_always_close(mut self, always_close: bool) -> Self {
        self.always_close = always_close;
        self
    }

    /// Whether the connection is closed after every release
    #[must_use]
    pub fn always_close(&self) -> bool {
        self.always_close
    }
}

impl Default for SingleConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager for SingleConnectionManager {
    fn id(&self) -> ManagerId {
        self.id
    }

    fn acquire_interruptible(
        &self,
        route: &Route,
        _wait: WaitPolicy,
        interrupt: &InterruptToken,
    ) -> Result<Connection, PoolError> {
        let now = Instant::now();
        let mut connection = {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(PoolError::Shutdown);
            }
            if interrupt.is_interrupted() {
                return Err(PoolError::Interrupted {
                    route: route.clone(),
                });
            }
            if let Some((id, _)) = state.leased {
                return Err(PoolError::InvalidOperation(format!(
                    "{id} is still leased; release it before acquiring again"
                )));
            }

            let connection = match state.idle.take() {
                Some(connection) => connection,
                None => {
                    state.created += 1;
                    Connection::new(self.id, route.clone())
                }
            };
            state.leased = Some((connection.id(), now));
            connection
        };

        if connection.route() != route {
            connection.rebind(route.clone());
        }
        connection.mark_leased(now);
        tracing::debug!(
            manager_id = %self.id,
            connection_id = %connection.id(),
            route = %route,
            "Leased single connection"
        );
        Ok(connection)
    }

    fn release(&self, mut connection: Connection) -> Result<(), PoolError> {
        let connection_id = connection.id();
        let mut state = self.state.lock();
        let leased = state.leased.is_some_and(|(id, _)| id == connection_id);
        if connection.owner() != self.id || !leased {
            drop(state);
            tracing::warn!(
                manager_id = %self.id,
                connection_id = %connection_id,
                "Rejected release of connection that is not leased"
            );
            return Err(PoolError::InvalidOperation(format!(
                "{connection_id} is not leased from {}",
                self.id
            )));
        }
        state.leased = None;

        if state.shutdown
            || self.always_close
            || !connection.is_open()
            || !connection.is_reusable()
        {
            state.closed += 1;
            drop(state);
            close_quietly(connection);
        } else {
            connection.mark_idle(Instant::now());
            state.idle = Some(connection);
        }
        tracing::debug!(manager_id = %self.id, connection_id = %connection_id, "Released single connection");
        Ok(())
    }

    fn close_idle_connections(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let expired = {
            let mut state = self.state.lock();
            let is_expired = state
                .idle
                .as_ref()
                .and_then(|connection| connection.idle_for(now))
                .is_some_and(|idle| idle > idle_timeout);
            if is_expired {
                state.closed += 1;
                state.idle.take()
            } else {
                None
            }
        };

        match expired {
            Some(connection) => {
                close_quietly(connection);
                1
            }
            None => 0,
        }
    }

    fn reclaim_abandoned_leases(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.leased {
            Some((id, leased_at)) if now.saturating_duration_since(leased_at) > max_age => {
                state.leased = None;
                state.reclaimed += 1;
                tracing::warn!(manager_id = %self.id, connection_id = %id, "Reclaimed abandoned lease");
                1
            }
            _ => 0,
        }
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let leased = usize::from(state.leased.is_some());
        let idle = usize::from(state.idle.is_some());
        PoolStats {
            leased,
            idle,
            total: leased + idle,
            waiting: 0,
            created: state.created,
            closed: state.closed,
            reclaimed: state.reclaimed,
            timeouts: 0,
        }
    }

    fn shutdown(&self) {
        let idle = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.idle.take()
        };
        if let Some(connection) = idle {
            close_quietly(connection);
        }
        tracing::info!(manager_id = %self.id, "Single connection manager shut down");
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}

impl fmt::Debug for SingleConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleConnectionManager")
            .field("id", &self.id)
            .field("always_close", &self.always_close)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_while_leased() {
        let manager = SingleConnectionManager::new();
        let route = Route::http("host1", 80);
        let conn = manager.acquire(&route, WaitPolicy::Indefinite).unwrap();

        let err = manager.acquire(&route, WaitPolicy::Indefinite).unwrap_err();
        assert!(matches!(err, PoolError::InvalidOperation(_)));

        manager.release(conn).unwrap();
        assert!(manager.acquire(&route, WaitPolicy::Immediate).is_ok());
    }

    #[test]
    fn test_double_release() {
        let manager = SingleConnectionManager::new();
        let route = Route::http("host1", 80);
        let conn = manager.acquire(&route, WaitPolicy::Immediate).unwrap();
        let id = conn.id();
        manager.release(conn).unwrap();

        // A stale handle with the same owner but no lease
        let stale = Connection::new(manager.id(), route);
        assert_ne!(stale.id(), id);
        assert!(matches!(
            manager.release(stale),
            Err(PoolError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_foreign_release() {
        let first = SingleConnectionManager::new();
        let second = SingleConnectionManager::new();
        let conn = first
            .acquire(&Route::http("host1", 80), WaitPolicy::Immediate)
            .unwrap();
        assert!(matches!(
            second.release(conn),
            Err(PoolError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_shutdown() {
        let manager = SingleConnectionManager::new();
        manager.shutdown();
        assert!(manager.is_shutdown());
        assert!(matches!(
            manager.acquire(&Route::http("host1", 80), WaitPolicy::Immediate),
            Err(PoolError::Shutdown)
        ));
    }

    #[test]
    fn test_stats() {
        let manager = SingleConnectionManager::new();
        let conn = manager
            .acquire(&Route::http("host1", 80), WaitPolicy::Immediate)
            .unwrap();
        let stats = manager.stats();
        assert_eq!(stats.leased, 1);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.created, 1);
        assert_eq!(manager.reclaim_abandoned_leases(Duration::from_secs(3600)), 0);
        drop(conn);
    }
}

//! Pool behaviour under contention
//!
//! These tests drive the managers from several threads against in-memory
//! transports. They cover:
//! - Global and per-route limits with bounded waits
//! - Route affinity and cross-route reclamation
//! - Interruption, shutdown and registry-wide shutdown
//! - Idle sweeps, peer-closed cleanup and the background reaper

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use common::{init_tracing, MockFactory};
use connpool_core::{
    Connection, ConnectionManager, Error, IdleConnectionReaper, InterruptToken, ManagerRegistry,
    PoolConfig, PoolError, PoolingConnectionManager, ReaperSettings, Route,
    SingleConnectionManager, WaitPolicy,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

fn pool(max_total: usize, max_per_route: usize) -> Arc<PoolingConnectionManager> {
    init_tracing();
    Arc::new(PoolingConnectionManager::new(
        PoolConfig::new()
            .with_max_total(max_total)
            .with_default_max_per_route(max_per_route),
    ))
}

fn connected(
    manager: &PoolingConnectionManager,
    route: &Route,
    factory: &MockFactory,
) -> Connection {
    manager
        .acquire_connected(route, WaitPolicy::Immediate, factory, CONNECT_TIMEOUT)
        .unwrap()
}

/// Block until `manager` reports `n` waiters
fn wait_for_waiters(manager: &PoolingConnectionManager, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.stats().waiting < n {
        assert!(Instant::now() < deadline, "waiters never queued");
        thread::sleep(Duration::from_millis(1));
    }
}

// =============================================================================
// Limits
// =============================================================================

#[test]
fn test_global_and_route_limits() {
    let manager = pool(2, 1);
    let route_a = Route::http("host-a", 80);
    let route_b = Route::http("host-b", 80);

    let _a = manager.acquire(&route_a, WaitPolicy::Immediate).unwrap();
    let b = manager.acquire(&route_b, WaitPolicy::Immediate).unwrap();

    let err = manager
        .acquire(&route_b, WaitPolicy::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, PoolError::Timeout { .. }));
    assert!(err.is_retryable());

    manager.release(b).unwrap();
    let started = Instant::now();
    let again = manager.acquire(&route_b, WaitPolicy::from_millis(100));
    assert!(again.is_ok());
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_route_override_limit() {
    init_tracing();
    let route = Route::http("host-a", 80);
    let manager = PoolingConnectionManager::new(
        PoolConfig::new()
            .with_default_max_per_route(1)
            .with_max_for_route(route.clone(), 3),
    );

    let held: Vec<Connection> = (0..3)
        .map(|_| manager.acquire(&route, WaitPolicy::Immediate).unwrap())
        .collect();
    assert_eq!(held.len(), 3);
    assert_eq!(manager.connections_in_pool_for(&route), 3);

    let err = manager
        .acquire(&route, WaitPolicy::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, PoolError::Timeout { .. }));

    // Other routes keep the default
    let other = Route::http("host-b", 80);
    assert_eq!(manager.max_for(&other), 1);
}

// =============================================================================
// Fairness and Reclamation
// =============================================================================

#[test]
fn test_release_prefers_same_route_waiter() {
    let manager = pool(2, 1);
    let factory = MockFactory::new();
    let route_a = Route::http("host-a", 80);
    let route_b = Route::http("host-b", 80);
    let route_c = Route::http("host-c", 80);

    let a = connected(&manager, &route_a, &factory);
    let a_id = a.id();
    let b = manager.acquire(&route_b, WaitPolicy::Immediate).unwrap();

    // C queues first, then A
    let waiter_c = {
        let manager = Arc::clone(&manager);
        let route = route_c.clone();
        thread::spawn(move || manager.acquire(&route, WaitPolicy::Indefinite))
    };
    wait_for_waiters(&manager, 1);
    let waiter_a = {
        let manager = Arc::clone(&manager);
        let route = route_a.clone();
        thread::spawn(move || manager.acquire(&route, WaitPolicy::Indefinite))
    };
    wait_for_waiters(&manager, 2);

    manager.release(a).unwrap();
    let reused = waiter_a.join().unwrap().unwrap();
    assert_eq!(reused.id(), a_id);
    assert!(reused.is_open());
    assert_eq!(manager.stats().waiting, 1);

    // Freeing B's slot lets C in
    manager.release(b).unwrap();
    let c = waiter_c.join().unwrap().unwrap();
    assert_eq!(c.route(), &route_c);
}

#[test]
fn test_cross_route_reclaim() {
    let manager = pool(1, 1);
    let factory = MockFactory::new();
    let route_a = Route::http("host-a", 80);
    let route_b = Route::http("host-b", 80);

    let a = connected(&manager, &route_a, &factory);
    manager.release(a).unwrap();
    assert_eq!(manager.route_stats(&route_a).idle, 1);

    let b = manager.acquire(&route_b, WaitPolicy::Immediate).unwrap();
    assert_eq!(b.route(), &route_b);
    assert!(factory.transport(0).is_closed());
    assert_eq!(manager.connections_in_pool_for(&route_a), 0);
    assert_eq!(manager.connections_in_pool(), 1);
    assert_eq!(manager.stats().reclaimed, 1);
}

#[test]
fn test_free_connection_reused_most_recent_first() {
    let manager = pool(4, 2);
    let factory = MockFactory::new();
    let route = Route::http("host-a", 80);

    let first = connected(&manager, &route, &factory);
    let second = connected(&manager, &route, &factory);
    let second_id = second.id();
    manager.release(first).unwrap();
    manager.release(second).unwrap();

    let reused = manager.acquire(&route, WaitPolicy::Immediate).unwrap();
    assert_eq!(reused.id(), second_id);
    assert_eq!(factory.connects(), 2);
}

// =============================================================================
// Interruption and Shutdown
// =============================================================================

#[test]
fn test_interrupted_waiter() {
    let manager = pool(1, 1);
    let route = Route::http("host-a", 80);
    let held = manager.acquire(&route, WaitPolicy::Immediate).unwrap();

    let token = InterruptToken::new();
    let waiter = {
        let manager = Arc::clone(&manager);
        let route = route.clone();
        let token = token.clone();
        thread::spawn(move || manager.acquire_interruptible(&route, WaitPolicy::Indefinite, &token))
    };
    wait_for_waiters(&manager, 1);

    token.interrupt();
    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err, PoolError::Interrupted { .. }));
    assert_eq!(manager.stats().waiting, 0);

    // The pool keeps working
    manager.release(held).unwrap();
    assert!(manager.acquire(&route, WaitPolicy::Immediate).is_ok());
}

#[test]
fn test_interrupt_wakes_every_waiter_sharing_token() {
    let manager = pool(1, 1);
    let route = Route::http("host-a", 80);
    let _held = manager.acquire(&route, WaitPolicy::Immediate).unwrap();

    let token = InterruptToken::new();
    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let route = route.clone();
            let token = token.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let result = manager.acquire_interruptible(
                    &route,
                    WaitPolicy::Bounded(Duration::from_millis(2000)),
                    &token,
                );
                (result, start.elapsed())
            })
        })
        .collect();
    wait_for_waiters(&manager, 2);

    token.interrupt();
    for waiter in waiters {
        let (result, elapsed) = waiter.join().unwrap();
        assert!(matches!(result, Err(PoolError::Interrupted { .. })));
        assert!(elapsed < Duration::from_secs(1), "woken after {elapsed:?}");
    }
    assert_eq!(manager.stats().waiting, 0);
}

#[test]
fn test_shutdown_wakes_waiter() {
    let manager = pool(1, 1);
    let route = Route::http("host-a", 80);
    let held = manager.acquire(&route, WaitPolicy::Immediate).unwrap();

    let waiter = {
        let manager = Arc::clone(&manager);
        let route = route.clone();
        thread::spawn(move || manager.acquire(&route, WaitPolicy::Indefinite))
    };
    wait_for_waiters(&manager, 1);

    manager.shutdown();
    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err, PoolError::Shutdown));
    assert!(!err.is_retryable());

    let started = Instant::now();
    assert!(matches!(
        manager.acquire(&route, WaitPolicy::Indefinite),
        Err(PoolError::Shutdown)
    ));
    assert!(started.elapsed() < Duration::from_secs(1));

    // Leases outstanding at shutdown are closed on release
    manager.release(held).unwrap();
    assert_eq!(manager.connections_in_pool(), 0);
}

#[test]
fn test_shutdown_closes_idle_connections() {
    let manager = pool(2, 2);
    let factory = MockFactory::new();
    let route = Route::http("host-a", 80);

    let conn = connected(&manager, &route, &factory);
    manager.release(conn).unwrap();
    manager.shutdown();

    assert!(factory.transport(0).is_closed());
    assert_eq!(manager.stats().idle, 0);
}

#[test]
fn test_registry_shutdown_all() {
    init_tracing();
    let registry = Arc::new(ManagerRegistry::new());
    let first = PoolingConnectionManager::with_registry(PoolConfig::new(), &registry);
    let second = PoolingConnectionManager::with_registry(PoolConfig::new(), &registry);
    assert_eq!(registry.count(), 2);
    assert!(registry.contains(first.id()));

    assert_eq!(registry.shutdown_all(), 2);
    assert!(first.is_shutdown());
    assert!(second.is_shutdown());
    assert_eq!(registry.count(), 0);
}

#[test]
fn test_registry_forgets_manager_shut_down_directly() {
    init_tracing();
    let registry = Arc::new(ManagerRegistry::new());
    let manager = PoolingConnectionManager::with_registry(PoolConfig::new(), &registry);

    manager.shutdown();
    assert!(!registry.contains(manager.id()));
    assert_eq!(registry.shutdown_all(), 0);
}

// =============================================================================
// Sweeps
// =============================================================================

#[test]
fn test_idle_sweep_keeps_fresh_connection() {
    let manager = pool(4, 2);
    let factory = MockFactory::new();
    let route = Route::http("host-a", 80);

    let old = connected(&manager, &route, &factory);
    let fresh = connected(&manager, &route, &factory);
    let fresh_id = fresh.id();

    manager.release(old).unwrap();
    thread::sleep(Duration::from_millis(80));
    manager.release(fresh).unwrap();

    assert_eq!(manager.close_idle_connections(Duration::from_millis(40)), 1);
    assert!(factory.transport(0).is_closed());
    assert!(!factory.transport(1).is_closed());
    assert_eq!(manager.route_stats(&route).idle, 1);

    let kept = manager.acquire(&route, WaitPolicy::Immediate).unwrap();
    assert_eq!(kept.id(), fresh_id);
}

#[test]
fn test_delete_closed_connections() {
    let manager = pool(4, 2);
    let factory = MockFactory::new();
    let route = Route::http("host-a", 80);

    let first = connected(&manager, &route, &factory);
    let second = connected(&manager, &route, &factory);
    manager.release(first).unwrap();
    manager.release(second).unwrap();

    factory.transport(0).hang_up();
    assert_eq!(manager.delete_closed_connections(), 1);
    assert_eq!(manager.connections_in_pool(), 1);
    // The peer already hung up; no close is sent on either transport
    assert!(!factory.transport(0).is_closed());
    assert!(!factory.transport(1).is_closed());
    assert_eq!(manager.delete_closed_connections(), 0);
}

#[test]
fn test_reaper_sweeps_until_removed() {
    let manager = pool(4, 2);
    let factory = MockFactory::new();
    let route = Route::http("host-a", 80);
    let reaper = IdleConnectionReaper::start(ReaperSettings::new(
        Duration::from_millis(10),
        Duration::from_millis(20),
    ))
    .unwrap();
    let shared: Arc<dyn ConnectionManager> = manager.clone();
    reaper.add_manager(Arc::clone(&shared));

    let conn = connected(&manager, &route, &factory);
    manager.release(conn).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.connections_in_pool() > 0 || reaper.sweeps() == 0 {
        assert!(Instant::now() < deadline, "reaper never swept");
        thread::sleep(Duration::from_millis(5));
    }

    assert!(reaper.remove_manager(shared.id()));
    let conn = connected(&manager, &route, &factory);
    manager.release(conn).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(manager.connections_in_pool(), 1);

    reaper.shutdown();
}

// =============================================================================
// Connect Failures and the Single-Slot Manager
// =============================================================================

#[test]
fn test_connect_failure_returns_slot() {
    let manager = pool(1, 1);
    let route = Route::http("host-a", 80);

    let err = manager
        .acquire_connected(
            &route,
            WaitPolicy::Immediate,
            &MockFactory::refusing(),
            CONNECT_TIMEOUT,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Connect(_)));
    assert_eq!(manager.connections_in_pool(), 0);
    assert!(manager.acquire(&route, WaitPolicy::Immediate).is_ok());
}

#[test]
fn test_single_manager_rebinds_route() {
    init_tracing();
    let manager = SingleConnectionManager::new();
    let factory = MockFactory::new();
    let route_a = Route::http("host-a", 80);
    let route_b = Route::https("host-b", 443);

    let conn = manager
        .acquire_connected(&route_a, WaitPolicy::Immediate, &factory, CONNECT_TIMEOUT)
        .unwrap();
    let id = conn.id();
    manager.release(conn).unwrap();

    let same = manager.acquire(&route_a, WaitPolicy::Immediate).unwrap();
    assert_eq!(same.id(), id);
    assert!(same.is_open());
    manager.release(same).unwrap();

    let rebound = manager.acquire(&route_b, WaitPolicy::Immediate).unwrap();
    assert_eq!(rebound.id(), id);
    assert_eq!(rebound.route(), &route_b);
    assert!(!rebound.is_open());
    assert!(factory.transport(0).is_closed());
}

#[test]
fn test_single_manager_always_close() {
    init_tracing();
    let manager = SingleConnectionManager::new().with_always_close(true);
    let factory = MockFactory::new();
    let route = Route::http("host-a", 80);

    let conn = manager
        .acquire_connected(&route, WaitPolicy::Immediate, &factory, CONNECT_TIMEOUT)
        .unwrap();
    manager.release(conn).unwrap();

    assert!(factory.transport(0).is_closed());
    assert_eq!(manager.stats().idle, 0);
}

//! Idle Connection Reaper
//!
//! Background thread that periodically closes idle connections, and
//! optionally reclaims abandoned leases, on every manager added to it.
//! Managers that report shut down are dropped from the sweep list.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::ConnectionManager;
use crate::config::PoolConfig;
use crate::connection::ManagerId;

/// Sweep timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperSettings {
    /// Time between sweeps
    pub interval: Duration,
    /// Free connections idle longer than this are closed
    pub idle_timeout: Duration,
    /// Leases older than this are reclaimed, if set
    pub lease_timeout: Option<Duration>,
}

impl ReaperSettings {
    /// Sweep every `interval`, closing connections idle past `idle_timeout`
    #[must_use]
    pub fn new(interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            interval,
            idle_timeout,
            lease_timeout: None,
        }
    }

    /// Also reclaim leases older than `timeout`
    #[must_use]
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = Some(timeout);
        self
    }
}

impl From<&PoolConfig> for ReaperSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            interval: config.reap_interval(),
            idle_timeout: config.idle_timeout(),
            lease_timeout: config.lease_timeout(),
        }
    }
}

struct ReaperState {
    managers: Vec<Arc<dyn ConnectionManager>>,
    stopped: bool,
}

struct ReaperShared {
    state: Mutex<ReaperState>,
    wake: Condvar,
    sweeps: AtomicU64,
}

/// Periodic idle-connection sweeper
pub struct IdleConnectionReaper {
    settings: ReaperSettings,
    shared: Arc<ReaperShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IdleConnectionReaper {
    /// Start the sweep thread
    ///
    /// # Errors
    ///
    /// Returns the error from spawning the thread.
    pub fn start(settings: ReaperSettings) -> io::Result<Self> {
        let shared = Arc::new(ReaperShared {
            state: Mutex::new(ReaperState {
                managers: Vec::new(),
                stopped: false,
            }),
            wake: Condvar::new(),
            sweeps: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("connpool-reaper".to_string())
            .spawn(move || run(&thread_shared, settings))?;

        tracing::info!(
            interval_ms = settings.interval.as_millis(),
            idle_timeout_ms = settings.idle_timeout.as_millis(),
            "Idle connection reaper started"
        );
        Ok(Self {
            settings,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Sweep timing
    #[must_use]
    pub fn settings(&self) -> ReaperSettings {
        self.settings
    }

    /// Add a manager to the sweep list
    pub fn add_manager(&self, manager: Arc<dyn ConnectionManager>) {
        let mut state = self.shared.state.lock();
        if !state.managers.iter().any(|m| m.id() == manager.id()) {
            tracing::debug!(manager_id = %manager.id(), "Reaper tracking manager");
            state.managers.push(manager);
        }
    }

    /// Remove a manager from the sweep list
    ///
    /// Returns `true` if it was being swept.
    pub fn remove_manager(&self, id: ManagerId) -> bool {
        let mut state = self.shared.state.lock();
        let before = state.managers.len();
        state.managers.retain(|manager| manager.id() != id);
        state.managers.len() != before
    }

    /// Number of managers being swept
    #[must_use]
    pub fn manager_count(&self) -> usize {
        self.shared.state.lock().managers.len()
    }

    /// Number of sweeps completed
    #[must_use]
    pub fn sweeps(&self) -> u64 {
        self.shared.sweeps.load(Ordering::SeqCst)
    }

    /// Whether the thread has been asked to stop
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// Stop the sweep thread and wait for it to exit
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.managers.clear();
            self.shared.wake.notify_all();
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("Idle connection reaper thread panicked");
            }
        }
        tracing::info!("Idle connection reaper stopped");
    }
}

impl Drop for IdleConnectionReaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for IdleConnectionReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleConnectionReaper")
            .field("settings", &self.settings)
            .field("sweeps", &self.sweeps())
            .finish_non_exhaustive()
    }
}

fn run(shared: &ReaperShared, settings: ReaperSettings) {
    loop {
        let managers = {
            let mut state = shared.state.lock();
            match Instant::now().checked_add(settings.interval) {
                Some(deadline) => {
                    while !state.stopped && Instant::now() < deadline {
                        shared.wake.wait_until(&mut state, deadline);
                    }
                }
                None => {
                    while !state.stopped {
                        shared.wake.wait(&mut state);
                    }
                }
            }
            if state.stopped {
                return;
            }
            state.managers.clone()
        };

        let mut finished = Vec::new();
        for manager in &managers {
            if manager.is_shutdown() {
                finished.push(manager.id());
                continue;
            }
            let closed = manager.close_idle_connections(settings.idle_timeout);
            let reclaimed = settings
                .lease_timeout
                .map_or(0, |timeout| manager.reclaim_abandoned_leases(timeout));
            if closed > 0 || reclaimed > 0 {
                tracing::debug!(manager_id = %manager.id(), closed, reclaimed, "Reaper sweep");
            }
        }
        drop(managers);

        if !finished.is_empty() {
            shared
                .state
                .lock()
                .managers
                .retain(|manager| !finished.contains(&manager.id()));
        }
        shared.sweeps.fetch_add(1, Ordering::SeqCst);
    }
}
